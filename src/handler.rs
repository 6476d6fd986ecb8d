//! Type-erased entry points into user methods.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_graphql::Name;
use async_graphql_value::{from_value, to_value, ConstValue};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::Principal;
use crate::container::{Container, Instance};
use crate::error::ContainerError;
use crate::loader::{BoxFuture, DataLoaders};
use crate::registry::DeclarationKind;
use crate::scope::RequestScope;

pub type Args = IndexMap<Name, ConstValue>;

pub type ValueStream = BoxStream<'static, anyhow::Result<ConstValue>>;

type FieldFn = dyn Fn(Instance, Invocation) -> BoxFuture<'static, anyhow::Result<ConstValue>> + Send + Sync;
type StreamFn = dyn Fn(Instance, Invocation) -> BoxFuture<'static, anyhow::Result<ValueStream>> + Send + Sync;

/// How a declared method is called once its target instance is resolved.
#[derive(Clone)]
pub enum Handler {
    Field(Arc<FieldFn>),
    Stream(Arc<StreamFn>),
}

impl Handler {
    /// Wraps an async method producing a single value.
    pub fn field<T, F, Fut, R, E>(method: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        Handler::Field(Arc::new(
            move |instance: Instance, call: Invocation| -> BoxFuture<'static, anyhow::Result<ConstValue>> {
                let this = match instance.downcast::<T>() {
                    Ok(this) => this,
                    Err(_) => return Box::pin(async { Err(instance_mismatch::<T>()) }),
                };
                let pending = method(this, call);
                Box::pin(async move {
                    let value = pending.await.map_err(Into::<anyhow::Error>::into)?;
                    Ok::<_, anyhow::Error>(to_value(&value)?)
                })
            },
        ))
    }

    /// Wraps an async method producing a stream of values.
    pub fn stream<T, F, Fut, S, R, E, SE>(method: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>, Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
        S: Stream<Item = Result<R, SE>> + Send + 'static,
        R: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
        SE: Into<anyhow::Error> + 'static,
    {
        Handler::Stream(Arc::new(
            move |instance: Instance, call: Invocation| -> BoxFuture<'static, anyhow::Result<ValueStream>> {
                let this = match instance.downcast::<T>() {
                    Ok(this) => this,
                    Err(_) => return Box::pin(async { Err(instance_mismatch::<T>()) }),
                };
                let pending = method(this, call);
                Box::pin(async move {
                    let stream = pending.await.map_err(Into::<anyhow::Error>::into)?;
                    let values = stream.map(|item| -> anyhow::Result<ConstValue> {
                        let value = item.map_err(Into::<anyhow::Error>::into)?;
                        Ok(to_value(&value)?)
                    });
                    Ok::<ValueStream, anyhow::Error>(values.boxed())
                })
            },
        ))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Handler::Stream(_))
    }
}

fn instance_mismatch<T>() -> anyhow::Error {
    anyhow::anyhow!("resolved instance is not a {}", type_name::<T>())
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Field(_) => f.write_str("Handler::Field"),
            Handler::Stream(_) => f.write_str("Handler::Stream"),
        }
    }
}

/// Where in the schema a resolver runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub parent_type: String,
    pub field_name: String,
    pub kind: DeclarationKind,
}

impl FieldInfo {
    pub fn new(parent_type: impl Into<String>, field_name: impl Into<String>, kind: DeclarationKind) -> Self {
        Self {
            parent_type: parent_type.into(),
            field_name: field_name.into(),
            kind,
        }
    }
}

impl fmt::Display for FieldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.parent_type, self.field_name)
    }
}

/// Everything a declared method receives besides `&self`.
#[derive(Debug, Clone)]
pub struct Invocation {
    parent: Option<ConstValue>,
    args: Args,
    scope: RequestScope,
    info: FieldInfo,
}

impl Invocation {
    pub fn new(parent: Option<ConstValue>, args: Args, scope: RequestScope, info: FieldInfo) -> Self {
        Self {
            parent,
            args,
            scope,
            info,
        }
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn arg_value(&self, name: &str) -> Option<&ConstValue> {
        self.args.get(name)
    }

    /// Deserializes one argument. An absent argument reads as `null`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self.args.get(name).cloned().unwrap_or(ConstValue::Null);
        from_value(value).with_context(|| format!("invalid argument '{name}'"))
    }

    /// Deserializes all arguments as one object.
    pub fn args_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        from_value(ConstValue::Object(self.args.clone())).context("invalid arguments")
    }

    pub fn parent_value(&self) -> Option<&ConstValue> {
        self.parent.as_ref()
    }

    pub fn parent<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = self
            .parent
            .clone()
            .with_context(|| format!("{} has no parent value", self.info))?;
        from_value(value).with_context(|| format!("invalid parent value for {}", self.info))
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn container(&self) -> &Container {
        self.scope.container()
    }

    /// Shorthand for resolving a capability from the scope's container.
    pub fn inject<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.scope.container().resolve::<T>()
    }

    pub fn loaders(&self) -> &DataLoaders {
        self.scope.loaders()
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.scope.principal()
    }

    pub fn info(&self) -> &FieldInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Providers;
    use serde::Deserialize;

    struct Greeter {
        greeting: &'static str,
    }

    fn invocation(args: Args) -> Invocation {
        let scope = RequestScope::new(Arc::new(Providers::new()));
        Invocation::new(
            None,
            args,
            scope,
            FieldInfo::new("Query", "greet", DeclarationKind::Query),
        )
    }

    fn args(pairs: &[(&str, ConstValue)]) -> Args {
        pairs
            .iter()
            .map(|(k, v)| (Name::new(k), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_field_handler_serializes_result() {
        let handler = Handler::field(|this: Arc<Greeter>, call: Invocation| async move {
            let name: String = call.arg("name")?;
            Ok::<_, anyhow::Error>(format!("{}, {}!", this.greeting, name))
        });

        let Handler::Field(call) = handler else {
            panic!("expected field handler");
        };
        let instance: Instance = Arc::new(Greeter { greeting: "Hello" });
        let result = call(instance, invocation(args(&[("name", ConstValue::String("Ada".into()))])))
            .await
            .unwrap();
        assert_eq!(result, ConstValue::String("Hello, Ada!".into()));
    }

    #[tokio::test]
    async fn test_field_handler_rejects_wrong_instance() {
        let handler = Handler::field(|_this: Arc<Greeter>, _call: Invocation| async move {
            Ok::<_, anyhow::Error>(1)
        });
        let Handler::Field(call) = handler else {
            panic!("expected field handler");
        };
        let err = call(Arc::new(5u8), invocation(Args::new())).await.unwrap_err();
        assert!(err.to_string().contains("Greeter"));
    }

    #[tokio::test]
    async fn test_stream_handler_maps_items() {
        let handler = Handler::stream(|_this: Arc<Greeter>, _call: Invocation| async move {
            let items = futures_util::stream::iter(vec![Ok::<_, anyhow::Error>(1), Ok(2)]);
            Ok::<_, anyhow::Error>(items)
        });
        assert!(handler.is_stream());

        let Handler::Stream(call) = handler else {
            panic!("expected stream handler");
        };
        let stream = call(Arc::new(Greeter { greeting: "" }), invocation(Args::new()))
            .await
            .unwrap();
        let values: Vec<_> = stream.map(|v| v.unwrap()).collect().await;
        assert_eq!(values, vec![ConstValue::from(1), ConstValue::from(2)]);
    }

    #[test]
    fn test_arg_extraction() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct NewItem {
            name: String,
            qty: Option<i64>,
        }

        let call = invocation(args(&[
            ("name", ConstValue::String("lamp".into())),
            ("qty", ConstValue::from(3)),
        ]));
        assert_eq!(call.arg::<i64>("qty").unwrap(), 3);
        assert_eq!(call.arg::<Option<String>>("missing").unwrap(), None);
        assert!(call.arg::<i64>("name").is_err());
        assert_eq!(
            call.args_as::<NewItem>().unwrap(),
            NewItem {
                name: "lamp".into(),
                qty: Some(3)
            }
        );
        assert!(call.parent::<String>().is_err());
    }
}
