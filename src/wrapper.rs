//! Executable resolvers built from compiled declarations.
//!
//! Every wrapped resolver runs the same pipeline: find the request scope,
//! check roles, validate arguments, resolve the target instance, call the
//! method, and map the outcome onto GraphQL values or errors.

use std::fmt;
use std::sync::Arc;

use async_graphql::dynamic::{
    Field, FieldFuture, FieldValue, InputValue, SubscriptionField, SubscriptionFieldFuture, TypeRef,
};
use async_graphql::{ErrorExtensions, Name};
use async_graphql_value::ConstValue;
use futures_util::stream::{BoxStream, StreamExt};

use crate::auth::{Action, RoleChecker};
use crate::container::Instance;
use crate::error::ResolverError;
use crate::handler::{Args, FieldInfo, Handler, Invocation};
use crate::registry::{DeclarationKind, TargetType};
use crate::scope::RequestScope;
use crate::validation::ArgsValidator;

pub type ResolvedStream = BoxStream<'static, Result<ConstValue, ResolverError>>;

/// How values of a field's named type are handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// Built-in or custom scalar. The value is passed whole, objects included.
    #[default]
    Scalar,
    /// Strings are emitted as enum values.
    Enum,
    /// Objects are kept whole as the parent of nested fields.
    Object,
}

/// One executable GraphQL field, immutable once the schema is built.
#[derive(Clone)]
pub struct CompiledField {
    pub parent_type: String,
    pub name: String,
    pub kind: DeclarationKind,
    pub roles: Vec<String>,
    pub validator: Option<Arc<dyn ArgsValidator>>,
    pub target: TargetType,
    pub handler: Handler,
    pub role_checker: Arc<dyn RoleChecker>,
    pub output: OutputKind,
}

impl CompiledField {
    pub fn info(&self) -> FieldInfo {
        FieldInfo::new(&self.parent_type, &self.name, self.kind)
    }

    /// Runs a field-flavoured resolver to completion.
    pub async fn resolve(
        &self,
        scope: Option<&RequestScope>,
        parent: Option<ConstValue>,
        args: Args,
    ) -> Result<ConstValue, ResolverError> {
        let (instance, call) = self.prepare(scope, parent, args).await?;
        match &self.handler {
            Handler::Field(method) => method(instance, call).await.map_err(ResolverError::Execution),
            Handler::Stream(_) => Err(ResolverError::Execution(anyhow::anyhow!(
                "{} produces a stream and can only be subscribed to",
                self.info()
            ))),
        }
    }

    /// Starts a stream-flavoured resolver. Item errors are mapped like
    /// resolver errors.
    pub async fn subscribe(
        &self,
        scope: Option<&RequestScope>,
        args: Args,
    ) -> Result<ResolvedStream, ResolverError> {
        let (instance, call) = self.prepare(scope, None, args).await?;
        match &self.handler {
            Handler::Stream(method) => {
                let stream = method(instance, call).await.map_err(ResolverError::Execution)?;
                Ok(stream.map(|item| item.map_err(ResolverError::Execution)).boxed())
            }
            Handler::Field(_) => Err(ResolverError::Execution(anyhow::anyhow!(
                "{} does not produce a stream",
                self.info()
            ))),
        }
    }

    async fn prepare(
        &self,
        scope: Option<&RequestScope>,
        parent: Option<ConstValue>,
        args: Args,
    ) -> Result<(Instance, Invocation), ResolverError> {
        let info = self.info();
        let Some(scope) = scope else {
            tracing::error!(field = %info, "no request scope in execution context");
            return Err(ResolverError::ScopeMissing);
        };

        if !self.roles.is_empty() {
            self.authorize(scope, &info).await?;
        }

        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate(&args).await {
                tracing::debug!(
                    field = %info,
                    violations = err.violations.len(),
                    "argument validation failed"
                );
                return Err(err.into());
            }
        }

        let instance = scope
            .container()
            .resolve_any(self.target.id, self.target.name)
            .map_err(|err| ResolverError::Execution(err.into()))?;

        Ok((instance, Invocation::new(parent, args, scope.clone(), info)))
    }

    async fn authorize(&self, scope: &RequestScope, info: &FieldInfo) -> Result<(), ResolverError> {
        let action = Action {
            principal: scope.principal(),
            scope,
            field: info,
        };
        let granted = self
            .role_checker
            .check(action, &self.roles)
            .await
            .map_err(ResolverError::Execution)?;
        if granted {
            return Ok(());
        }

        tracing::info!(
            field = %info,
            principal = scope.principal().map(|p| p.id.as_str()),
            roles = ?self.roles,
            "authorization denied"
        );
        Err(ResolverError::Unauthorized {
            roles: self.roles.clone(),
        })
    }

    pub(crate) fn into_field(self: Arc<Self>, ty: TypeRef, arguments: Vec<InputValue>) -> Field {
        let name = self.name.clone();
        let field = Field::new(name, ty, move |ctx| {
            let compiled = self.clone();
            FieldFuture::new(async move {
                let scope = ctx.data_opt::<RequestScope>();
                let parent = ctx.parent_value.downcast_ref::<ConstValue>().cloned();
                let args = ctx.args.as_index_map().clone();
                let value = compiled
                    .resolve(scope, parent, args)
                    .await
                    .map_err(|err| err.extend())?;
                Ok(to_field_value(value, compiled.output))
            })
        });
        arguments.into_iter().fold(field, Field::argument)
    }

    pub(crate) fn into_subscription_field(
        self: Arc<Self>,
        ty: TypeRef,
        arguments: Vec<InputValue>,
    ) -> SubscriptionField {
        let name = self.name.clone();
        let field = SubscriptionField::new(name, ty, move |ctx| {
            let compiled = self.clone();
            SubscriptionFieldFuture::new(async move {
                let scope = ctx.data_opt::<RequestScope>();
                let args = ctx.args.as_index_map().clone();
                let stream = compiled
                    .subscribe(scope, args)
                    .await
                    .map_err(|err| err.extend())?;
                let output = compiled.output;
                Ok(stream.map(move |item| match item {
                    Ok(value) => Ok(to_field_value(value, output).unwrap_or(FieldValue::NULL)),
                    Err(err) => Err(err.extend()),
                }))
            })
        });
        arguments.into_iter().fold(field, SubscriptionField::argument)
    }
}

impl fmt::Debug for CompiledField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledField")
            .field("field", &format_args!("{}.{}", self.parent_type, self.name))
            .field("kind", &self.kind)
            .field("roles", &self.roles)
            .field("validator", &self.validator.is_some())
            .field("target", &self.target.name)
            .finish()
    }
}

/// A field of an object type that reads a key of its parent object.
pub(crate) fn data_field(name: &str, ty: TypeRef, output: OutputKind) -> Field {
    let key = name.to_string();
    Field::new(name.to_string(), ty, move |ctx| {
        let key = key.clone();
        FieldFuture::new(async move {
            let value = match ctx.parent_value.downcast_ref::<ConstValue>() {
                Some(ConstValue::Object(object)) => object.get(key.as_str()).cloned(),
                _ => None,
            };
            Ok(value.and_then(|value| to_field_value(value, output)))
        })
    })
}

/// Converts a resolved value into what the engine expects. Lists are only
/// split for enum and object fields; a scalar keeps its value as is.
pub(crate) fn to_field_value(value: ConstValue, output: OutputKind) -> Option<FieldValue<'static>> {
    match (value, output) {
        (ConstValue::Null, _) => None,
        (value, OutputKind::Scalar) => Some(FieldValue::value(value)),
        (ConstValue::List(items), _) => Some(FieldValue::list(
            items
                .into_iter()
                .map(|item| to_field_value(item, output).unwrap_or(FieldValue::NULL)),
        )),
        (ConstValue::String(text), OutputKind::Enum) => {
            Some(FieldValue::value(ConstValue::Enum(Name::new(text))))
        }
        (value @ ConstValue::Object(_), OutputKind::Object) => Some(FieldValue::owned_any(value)),
        (other, _) => Some(FieldValue::value(other)),
    }
}
