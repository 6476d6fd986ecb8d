//! Declaration records and the registry that collects them.
//!
//! Records are plain data. They are produced by the `#[controller]` and
//! `#[resolver]` macros (through a generated [`Declarations`] impl) or built by
//! hand, collected in a [`Registry`], and only interpreted when the schema is
//! compiled.

use std::any::{type_name, TypeId};
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::container::Factory;
use crate::handler::Handler;
use crate::validation::ArgsValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclarationKind {
    Controller,
    Resolver,
    Resolve,
    Query,
    Mutation,
    Subscription,
    Authorized,
    ArgsValidator,
}

impl DeclarationKind {
    /// The root operation type a field of this kind lives on.
    pub fn root_type_name(self) -> Option<&'static str> {
        match self {
            Self::Query => Some("Query"),
            Self::Mutation => Some("Mutation"),
            Self::Subscription => Some("Subscription"),
            _ => None,
        }
    }

    /// Kinds that contribute a GraphQL field backed by a method.
    pub fn is_field(self) -> bool {
        matches!(
            self,
            Self::Resolve | Self::Query | Self::Mutation | Self::Subscription
        )
    }
}

impl fmt::Display for DeclarationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Controller => "controller",
            Self::Resolver => "resolver",
            Self::Resolve => "resolve",
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
            Self::Authorized => "authorized",
            Self::ArgsValidator => "args_validator",
        };
        f.write_str(name)
    }
}

/// The Rust type a declaration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetType {
    pub id: TypeId,
    pub name: &'static str,
}

impl TargetType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// Last path segment of the type name, without generics.
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        base.rsplit("::").next().unwrap_or(base)
    }

    /// GraphQL object name derived from the type: `UserResolver` becomes `User`.
    pub fn conventional_name(&self) -> &'static str {
        let short = self.short_name();
        match short.strip_suffix("Resolver") {
            Some(stripped) if !stripped.is_empty() => stripped,
            _ => short,
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// An argument of a declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub name: String,
    pub ty: String,
    pub description: Option<String>,
}

/// GraphQL-facing metadata of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    /// Type expression such as `[Item!]!`.
    pub returns: String,
    pub arguments: Vec<InputSpec>,
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, returns: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            returns: returns.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct DeclarationRecord {
    pub kind: DeclarationKind,
    pub target: TargetType,
    /// `None` for class-level records.
    pub method_name: Option<String>,
    pub graph_type_name: Option<String>,
    /// Empty means unrestricted.
    pub roles: Vec<String>,
    pub validator: Option<Arc<dyn ArgsValidator>>,
    pub field: Option<FieldSpec>,
    pub handler: Option<Handler>,
    pub factory: Option<Factory>,
    pub data_fields: Vec<FieldSpec>,
}

impl DeclarationRecord {
    fn blank(kind: DeclarationKind, target: TargetType) -> Self {
        Self {
            kind,
            target,
            method_name: None,
            graph_type_name: None,
            roles: Vec::new(),
            validator: None,
            field: None,
            handler: None,
            factory: None,
            data_fields: Vec::new(),
        }
    }

    fn method<T: 'static>(kind: DeclarationKind, method: &str) -> Self {
        let mut record = Self::blank(kind, TargetType::of::<T>());
        record.method_name = Some(method.to_string());
        record.field = Some(FieldSpec {
            name: method.to_string(),
            ..FieldSpec::default()
        });
        record
    }

    /// Marks `T` as a controller whose methods contribute root fields.
    pub fn controller<T: 'static>(factory: Factory) -> Self {
        let mut record = Self::blank(DeclarationKind::Controller, TargetType::of::<T>());
        record.factory = Some(factory);
        record
    }

    /// Marks `T` as the resolver of one GraphQL object type.
    pub fn resolver<T: 'static>(factory: Factory) -> Self {
        let mut record = Self::blank(DeclarationKind::Resolver, TargetType::of::<T>());
        record.factory = Some(factory);
        record
    }

    pub fn query<T: 'static>(method: &str) -> Self {
        Self::method::<T>(DeclarationKind::Query, method)
    }

    pub fn mutation<T: 'static>(method: &str) -> Self {
        Self::method::<T>(DeclarationKind::Mutation, method)
    }

    pub fn subscription<T: 'static>(method: &str) -> Self {
        Self::method::<T>(DeclarationKind::Subscription, method)
    }

    pub fn resolve<T: 'static>(method: &str) -> Self {
        Self::method::<T>(DeclarationKind::Resolve, method)
    }

    /// Restricts a whole type (`method == None`) or one of its methods.
    pub fn authorized<T: 'static, R>(method: Option<&str>, roles: R) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
    {
        let mut record = Self::blank(DeclarationKind::Authorized, TargetType::of::<T>());
        record.method_name = method.map(str::to_string);
        record.roles = roles.into_iter().map(Into::into).collect();
        record
    }

    pub fn args_validator<T: 'static, V>(method: &str, validator: V) -> Self
    where
        V: ArgsValidator + 'static,
    {
        let mut record = Self::blank(DeclarationKind::ArgsValidator, TargetType::of::<T>());
        record.method_name = Some(method.to_string());
        record.validator = Some(Arc::new(validator));
        record
    }

    pub fn graph_type(mut self, name: impl Into<String>) -> Self {
        self.graph_type_name = Some(name.into());
        self
    }

    /// Adds a field read straight from the parent value.
    pub fn data_field(mut self, name: impl Into<String>, returns: impl Into<String>) -> Self {
        self.data_fields.push(FieldSpec::new(name, returns));
        self
    }

    /// Overrides the GraphQL field name, which defaults to the method name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.field_mut().name = name.into();
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.field_mut().returns = ty.into();
        self
    }

    pub fn argument(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.field_mut().arguments.push(InputSpec {
            name: name.into(),
            ty: ty.into(),
            description: None,
        });
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.field_mut().description = Some(text.into());
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    fn field_mut(&mut self) -> &mut FieldSpec {
        self.field.get_or_insert_with(FieldSpec::default)
    }

    fn key(&self) -> (TypeId, Option<&str>, DeclarationKind) {
        (self.target.id, self.method_name.as_deref(), self.kind)
    }

    /// `Type::method` or `Type` for log and error messages.
    pub fn describe(&self) -> String {
        match &self.method_name {
            Some(method) => format!("{}::{}", self.target.short_name(), method),
            None => self.target.short_name().to_string(),
        }
    }
}

impl fmt::Debug for DeclarationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclarationRecord")
            .field("kind", &self.kind)
            .field("target", &self.target.name)
            .field("method_name", &self.method_name)
            .field("graph_type_name", &self.graph_type_name)
            .field("roles", &self.roles)
            .field("validator", &self.validator.is_some())
            .field("field", &self.field)
            .field("handler", &self.handler)
            .field("factory", &self.factory)
            .field("data_fields", &self.data_fields)
            .finish()
    }
}

/// Implemented by types that describe their GraphQL surface as records.
pub trait Declarations {
    fn declarations() -> Vec<DeclarationRecord>;
}

/// Ordered store of declaration records.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: Vec<DeclarationRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `record`, or replaces the record with the same
    /// `(target, method, kind)` while keeping its position.
    pub fn register(&mut self, record: DeclarationRecord) {
        match self.records.iter().position(|r| r.key() == record.key()) {
            Some(index) => {
                tracing::debug!(
                    declaration = %record.describe(),
                    kind = %record.kind,
                    "replacing declaration"
                );
                self.records[index] = record;
            }
            None => self.records.push(record),
        }
    }

    pub fn register_all<D: Declarations>(&mut self) {
        for record in D::declarations() {
            self.register(record);
        }
    }

    pub fn get_all(
        &self,
        kind: DeclarationKind,
    ) -> impl Iterator<Item = &DeclarationRecord> + Clone + '_ {
        self.records.iter().filter(move |r| r.kind == kind)
    }

    pub fn find(
        &self,
        target: TypeId,
        method: Option<&str>,
        kind: DeclarationKind,
    ) -> Option<&DeclarationRecord> {
        self.records
            .iter()
            .find(|r| r.key() == (target, method, kind))
    }

    pub fn records(&self) -> &[DeclarationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

static GLOBAL_REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();

/// The process-wide registry, created on first access.
pub fn global_registry() -> &'static RwLock<Registry> {
    GLOBAL_REGISTRY.get_or_init(|| RwLock::new(Registry::new()))
}

/// Registers everything `D` declares in the global registry.
pub fn register<D: Declarations>() {
    global_registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register_all::<D>();
}

pub fn register_record(record: DeclarationRecord) {
    global_registry()
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(record);
}

/// A copy of the global registry as it is right now.
pub fn global_snapshot() -> Registry {
    global_registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Invocation;

    #[derive(Default)]
    struct ItemController;

    #[derive(Default)]
    struct UserResolver;

    fn ping() -> DeclarationRecord {
        DeclarationRecord::query::<ItemController>("ping")
            .returns("String!")
            .handler(Handler::field(
                |_this: Arc<ItemController>, _call: Invocation| async move {
                    Ok::<_, anyhow::Error>("pong")
                },
            ))
    }

    #[test]
    fn test_reregistration_overwrites_in_place() {
        let mut registry = Registry::new();
        registry.register(DeclarationRecord::controller::<ItemController>(
            Factory::from_default::<ItemController>(),
        ));
        registry.register(ping());
        registry.register(DeclarationRecord::query::<ItemController>("items").returns("[String!]!"));
        registry.register(ping().description("replaced"));

        assert_eq!(registry.len(), 3);
        let queries: Vec<_> = registry.get_all(DeclarationKind::Query).collect();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].method_name.as_deref(), Some("ping"));
        assert_eq!(
            queries[0].field.as_ref().and_then(|f| f.description.as_deref()),
            Some("replaced")
        );
    }

    #[test]
    fn test_same_method_different_kind_is_distinct() {
        let mut registry = Registry::new();
        registry.register(ping());
        registry.register(DeclarationRecord::authorized::<ItemController, _>(
            Some("ping"),
            ["admin"],
        ));
        registry.register(DeclarationRecord::authorized::<ItemController, _>(None, ["user"]));

        assert_eq!(registry.len(), 3);
        let found = registry
            .find(
                TypeId::of::<ItemController>(),
                Some("ping"),
                DeclarationKind::Authorized,
            )
            .unwrap();
        assert_eq!(found.roles, vec!["admin".to_string()]);
    }

    #[test]
    fn test_get_all_is_restartable() {
        let mut registry = Registry::new();
        registry.register(ping());
        let iter = registry.get_all(DeclarationKind::Query);
        assert_eq!(iter.clone().count(), 1);
        assert_eq!(iter.count(), 1);
        assert_eq!(registry.get_all(DeclarationKind::Mutation).count(), 0);
    }

    #[test]
    fn test_conventional_names() {
        assert_eq!(TargetType::of::<UserResolver>().conventional_name(), "User");
        assert_eq!(TargetType::of::<ItemController>().short_name(), "ItemController");

        struct Resolver;
        assert_eq!(TargetType::of::<Resolver>().conventional_name(), "Resolver");
    }

    #[test]
    fn test_register_all_from_declarations() {
        struct Declared;
        impl Declarations for Declared {
            fn declarations() -> Vec<DeclarationRecord> {
                vec![
                    DeclarationRecord::resolver::<UserResolver>(Factory::from_default::<UserResolver>())
                        .data_field("id", "ID!"),
                    DeclarationRecord::resolve::<UserResolver>("friends").returns("[User!]!"),
                ]
            }
        }

        let mut registry = Registry::new();
        registry.register_all::<Declared>();
        registry.register_all::<Declared>();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.records()[0].data_fields[0].name, "id");
    }
}
