//! Compiles a [`Registry`] into an executable [`CompiledSchema`].
//!
//! Compilation is all-or-nothing: declarations are assembled into an
//! intermediate type graph, merged with hand-written SDL, checked, and only
//! then registered with the engine.

mod sdl;
mod type_expr;

pub use type_expr::TypeExpr;

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_graphql::dynamic::{
    self, Enum, EnumItem, InputObject, InputValue, Object, Scalar, Subscription,
};
use async_graphql_value::ConstValue;
use indexmap::IndexMap;

use self::sdl::{ExplicitInput, ExplicitKind, ExplicitType};
use crate::auth::{default_role_checker, RoleChecker};
use crate::config::SchemaConfig;
use crate::container::Providers;
use crate::error::SchemaError;
use crate::handler::Handler;
use crate::registry::{DeclarationKind, DeclarationRecord, Declarations, Registry, TargetType};
use crate::schema::CompiledSchema;
use crate::validation::ArgsValidator;
use crate::wrapper::{self, CompiledField, OutputKind};

const BUILTIN_SCALARS: [&str; 5] = ["Int", "Float", "String", "Boolean", "ID"];

/// A bundle of declarations, type definitions and providers compiled together
/// with the registry.
#[derive(Clone, Default)]
pub struct GraphModule {
    pub name: String,
    pub type_defs: Vec<String>,
    pub declarations: Vec<DeclarationRecord>,
    pub providers: Providers,
}

impl GraphModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn type_defs(mut self, sdl: impl Into<String>) -> Self {
        self.type_defs.push(sdl.into());
        self
    }

    pub fn declare<D: Declarations>(mut self) -> Self {
        self.declarations.extend(D::declarations());
        self
    }

    pub fn record(mut self, record: DeclarationRecord) -> Self {
        self.declarations.push(record);
        self
    }

    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers.merge(&providers);
        self
    }
}

impl fmt::Debug for GraphModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphModule")
            .field("name", &self.name)
            .field("type_defs", &self.type_defs.len())
            .field("declarations", &self.declarations.len())
            .field("providers", &self.providers)
            .finish()
    }
}

#[derive(Clone)]
pub struct SchemaBuilderOptions {
    pub type_defs: Vec<String>,
    pub modules: Vec<GraphModule>,
    pub providers: Providers,
    pub role_checker: Arc<dyn RoleChecker>,
    pub max_depth: Option<usize>,
    pub max_complexity: Option<usize>,
    pub introspection: bool,
}

impl Default for SchemaBuilderOptions {
    fn default() -> Self {
        Self {
            type_defs: Vec::new(),
            modules: Vec::new(),
            providers: Providers::new(),
            role_checker: default_role_checker(),
            max_depth: None,
            max_complexity: None,
            introspection: true,
        }
    }
}

impl SchemaBuilderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn type_defs(mut self, sdl: impl Into<String>) -> Self {
        self.type_defs.push(sdl.into());
        self
    }

    pub fn module(mut self, module: GraphModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn providers(mut self, providers: Providers) -> Self {
        self.providers.merge(&providers);
        self
    }

    pub fn role_checker(mut self, checker: Arc<dyn RoleChecker>) -> Self {
        self.role_checker = checker;
        self
    }

    /// Applies the `[schema]` section of the framework configuration.
    pub fn with_config(mut self, config: &SchemaConfig) -> Self {
        self.max_depth = config.max_depth;
        self.max_complexity = config.max_complexity;
        self.introspection = config.introspection;
        self
    }
}

impl fmt::Debug for SchemaBuilderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaBuilderOptions")
            .field("type_defs", &self.type_defs.len())
            .field("modules", &self.modules)
            .field("providers", &self.providers)
            .field("max_depth", &self.max_depth)
            .field("max_complexity", &self.max_complexity)
            .field("introspection", &self.introspection)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    options: SchemaBuilderOptions,
}

impl SchemaBuilder {
    pub fn new(options: SchemaBuilderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SchemaBuilderOptions {
        &self.options
    }

    pub fn build(&self, registry: &Registry) -> Result<CompiledSchema, SchemaError> {
        let mut registry = registry.clone();
        let mut providers = self.options.providers.clone();
        let mut type_defs = self.options.type_defs.clone();
        for module in &self.options.modules {
            for record in &module.declarations {
                registry.register(record.clone());
            }
            providers.merge(&module.providers);
            type_defs.extend(module.type_defs.iter().cloned());
        }

        let mut assembly = Assembly::new(self.options.role_checker.clone());
        assembly.collect_attachments(&registry)?;
        assembly.install_factories(&registry, &mut providers);
        assembly.synthesize_objects(&registry)?;
        assembly.add_method_fields(&registry, &providers)?;
        for sdl in &type_defs {
            for explicit in sdl::parse_type_defs(sdl)? {
                assembly.add_explicit(explicit)?;
            }
        }
        assembly.validate()?;

        self.finish(assembly, providers)
    }

    fn finish(&self, assembly: Assembly, providers: Providers) -> Result<CompiledSchema, SchemaError> {
        let kinds = assembly.kinds();
        let has_mutation = assembly.types.contains_key("Mutation");
        let has_subscription = assembly.types.contains_key("Subscription");

        let mut builder = dynamic::Schema::build(
            "Query",
            has_mutation.then_some("Mutation"),
            has_subscription.then_some("Subscription"),
        );
        let mut fields = IndexMap::new();
        let mut counts = (0usize, 0usize, 0usize);

        for (name, def) in assembly.types {
            match def.shape {
                Shape::Object(object) if name == "Subscription" => {
                    let mut subscription = Subscription::new(name.as_str());
                    if let Some(description) = &def.description {
                        subscription = subscription.description(description);
                    }
                    for field in object.into_values() {
                        let Some(compiled) = field.compile(&name, &kinds) else {
                            continue;
                        };
                        counts.2 += 1;
                        fields.insert((name.clone(), compiled.name.clone()), compiled.clone());
                        subscription = subscription.field(
                            compiled.into_subscription_field(field.ty.to_type_ref(), field.arguments()),
                        );
                    }
                    builder = builder.register(subscription);
                }
                Shape::Object(object) => {
                    let mut dynamic_object = Object::new(name.as_str());
                    if let Some(description) = &def.description {
                        dynamic_object = dynamic_object.description(description);
                    }
                    for field in object.into_values() {
                        let ty = field.ty.to_type_ref();
                        let arguments = field.arguments();
                        let description = field.description.clone();
                        let mut dynamic_field = match field.compile(&name, &kinds) {
                            Some(compiled) => {
                                match name.as_str() {
                                    "Query" => counts.0 += 1,
                                    "Mutation" => counts.1 += 1,
                                    _ => {}
                                }
                                fields.insert((name.clone(), compiled.name.clone()), compiled.clone());
                                compiled.into_field(ty, arguments)
                            }
                            None => {
                                let output = output_kind(&kinds, field.ty.base_name());
                                arguments
                                    .into_iter()
                                    .fold(wrapper::data_field(&field.name, ty, output), dynamic::Field::argument)
                            }
                        };
                        if let Some(description) = description {
                            dynamic_field = dynamic_field.description(description);
                        }
                        dynamic_object = dynamic_object.field(dynamic_field);
                    }
                    builder = builder.register(dynamic_object);
                }
                Shape::Input(inputs) => {
                    let mut input = InputObject::new(name.as_str());
                    if let Some(description) = &def.description {
                        input = input.description(description);
                    }
                    for field in inputs {
                        input = input.field(input_value(field));
                    }
                    builder = builder.register(input);
                }
                Shape::Enum(values) => {
                    let mut dynamic_enum = Enum::new(name.as_str());
                    if let Some(description) = &def.description {
                        dynamic_enum = dynamic_enum.description(description);
                    }
                    for value in values {
                        let mut item = EnumItem::new(value.name);
                        if let Some(description) = value.description {
                            item = item.description(description);
                        }
                        dynamic_enum = dynamic_enum.item(item);
                    }
                    builder = builder.register(dynamic_enum);
                }
                Shape::Scalar => {
                    let mut scalar = Scalar::new(name.as_str());
                    if let Some(description) = &def.description {
                        scalar = scalar.description(description);
                    }
                    builder = builder.register(scalar);
                }
                Shape::Builtin => {}
            }
        }

        if let Some(depth) = self.options.max_depth {
            builder = builder.limit_depth(depth);
        }
        if let Some(complexity) = self.options.max_complexity {
            builder = builder.limit_complexity(complexity);
        }
        if !self.options.introspection {
            builder = builder.disable_introspection();
        }

        let schema = builder.finish().map_err(|err| SchemaError::Build {
            message: err.to_string(),
        })?;

        tracing::info!(
            types = kinds.len() - BUILTIN_SCALARS.len(),
            queries = counts.0,
            mutations = counts.1,
            subscriptions = counts.2,
            providers = providers.len(),
            "compiled GraphQL schema"
        );

        Ok(CompiledSchema::new(schema, Arc::new(providers), fields))
    }
}

fn input_value(input: ArgDef) -> InputValue {
    let mut value = InputValue::new(input.name, input.ty.to_type_ref());
    if let Some(description) = input.description {
        value = value.description(description);
    }
    if let Some(default) = input.default_value {
        value = value.default_value(default);
    }
    value
}

fn output_kind(kinds: &HashMap<String, Kind>, base_name: &str) -> OutputKind {
    match kinds.get(base_name) {
        Some(Kind::Enum) => OutputKind::Enum,
        Some(Kind::Object) => OutputKind::Object,
        _ => OutputKind::Scalar,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Scalar,
    Enum,
    Input,
    Object,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Scalar => "scalar",
            Kind::Enum => "enum",
            Kind::Input => "input",
            Kind::Object => "object",
        }
    }
}

#[derive(Clone)]
struct ArgDef {
    name: String,
    ty: TypeExpr,
    description: Option<String>,
    default_value: Option<ConstValue>,
}

impl From<ExplicitInput> for ArgDef {
    fn from(input: ExplicitInput) -> Self {
        Self {
            name: input.name,
            ty: input.ty,
            description: input.description,
            default_value: input.default_value,
        }
    }
}

/// What backs a field before it is registered.
#[derive(Clone)]
enum Source {
    /// Read from the parent object.
    Data,
    Method(MethodSource),
}

#[derive(Clone)]
struct MethodSource {
    kind: DeclarationKind,
    target: TargetType,
    handler: Handler,
    roles: Vec<String>,
    validator: Option<Arc<dyn ArgsValidator>>,
    role_checker: Arc<dyn RoleChecker>,
}

#[derive(Clone)]
struct FieldDef {
    name: String,
    ty: TypeExpr,
    arguments: Vec<ArgDef>,
    description: Option<String>,
    source: Source,
}

impl FieldDef {
    fn arguments(&self) -> Vec<InputValue> {
        self.arguments.iter().cloned().map(input_value).collect()
    }

    fn compile(&self, parent_type: &str, kinds: &HashMap<String, Kind>) -> Option<Arc<CompiledField>> {
        let Source::Method(method) = &self.source else {
            return None;
        };
        Some(Arc::new(CompiledField {
            parent_type: parent_type.to_string(),
            name: self.name.clone(),
            kind: method.kind,
            roles: method.roles.clone(),
            validator: method.validator.clone(),
            target: method.target,
            handler: method.handler.clone(),
            role_checker: method.role_checker.clone(),
            output: output_kind(kinds, self.ty.base_name()),
        }))
    }
}

enum Shape {
    Object(IndexMap<String, FieldDef>),
    Input(Vec<ArgDef>),
    Enum(Vec<sdl::ExplicitEnumValue>),
    Scalar,
    Builtin,
}

struct TypeDef {
    origin: String,
    description: Option<String>,
    shape: Shape,
}

impl TypeDef {
    fn kind(&self) -> Kind {
        match self.shape {
            Shape::Object(_) => Kind::Object,
            Shape::Input(_) => Kind::Input,
            Shape::Enum(_) => Kind::Enum,
            Shape::Scalar | Shape::Builtin => Kind::Scalar,
        }
    }
}

struct Assembly {
    role_checker: Arc<dyn RoleChecker>,
    types: IndexMap<String, TypeDef>,
    /// Resolver targets and the object type they synthesize.
    resolver_types: HashMap<TypeId, String>,
    class_roles: HashMap<TypeId, Vec<String>>,
    method_roles: HashMap<(TypeId, String), Vec<String>>,
    validators: HashMap<(TypeId, String), Arc<dyn ArgsValidator>>,
}

impl Assembly {
    fn new(role_checker: Arc<dyn RoleChecker>) -> Self {
        let mut types = IndexMap::new();
        for scalar in BUILTIN_SCALARS {
            types.insert(
                scalar.to_string(),
                TypeDef {
                    origin: "built-in scalars".into(),
                    description: None,
                    shape: Shape::Builtin,
                },
            );
        }
        Self {
            role_checker,
            types,
            resolver_types: HashMap::new(),
            class_roles: HashMap::new(),
            method_roles: HashMap::new(),
            validators: HashMap::new(),
        }
    }

    fn insert_type(&mut self, name: String, def: TypeDef) -> Result<(), SchemaError> {
        if let Some(existing) = self.types.get(&name) {
            return Err(SchemaError::DuplicateType {
                type_name: name,
                first: existing.origin.clone(),
                second: def.origin,
            });
        }
        self.types.insert(name, def);
        Ok(())
    }

    fn collect_attachments(&mut self, registry: &Registry) -> Result<(), SchemaError> {
        for record in registry.get_all(DeclarationKind::Authorized) {
            match &record.method_name {
                Some(method) => {
                    self.method_roles
                        .insert((record.target.id, method.clone()), record.roles.clone());
                }
                None => {
                    self.class_roles.insert(record.target.id, record.roles.clone());
                }
            }
        }

        for record in registry.get_all(DeclarationKind::ArgsValidator) {
            let (Some(method), Some(validator)) = (&record.method_name, &record.validator) else {
                return Err(SchemaError::malformed(
                    record.describe(),
                    "an args validator needs both a method and a validator",
                ));
            };
            self.validators
                .insert((record.target.id, method.clone()), validator.clone());
        }
        Ok(())
    }

    /// Class-level factories, unless a provider was registered explicitly.
    fn install_factories(&self, registry: &Registry, providers: &mut Providers) {
        let classes = registry
            .get_all(DeclarationKind::Controller)
            .chain(registry.get_all(DeclarationKind::Resolver));
        for record in classes {
            if let Some(factory) = &record.factory {
                if !providers.contains(record.target.id) {
                    providers.insert_factory(record.target.id, factory.clone());
                }
            }
        }
    }

    fn synthesize_objects(&mut self, registry: &Registry) -> Result<(), SchemaError> {
        for record in registry.get_all(DeclarationKind::Resolver) {
            let name = record
                .graph_type_name
                .clone()
                .unwrap_or_else(|| record.target.conventional_name().to_string());

            let mut fields = IndexMap::new();
            for spec in &record.data_fields {
                let field = FieldDef {
                    name: spec.name.clone(),
                    ty: parse_type(&format!("{name}.{}", spec.name), &spec.returns)?,
                    arguments: Vec::new(),
                    description: spec.description.clone(),
                    source: Source::Data,
                };
                insert_field(&name, &mut fields, field)?;
            }

            self.insert_type(
                name.clone(),
                TypeDef {
                    origin: format!("resolver {}", record.target.name),
                    description: None,
                    shape: Shape::Object(fields),
                },
            )?;
            self.resolver_types.insert(record.target.id, name);
        }
        Ok(())
    }

    fn add_method_fields(&mut self, registry: &Registry, providers: &Providers) -> Result<(), SchemaError> {
        for record in registry.records().iter().filter(|r| r.kind.is_field()) {
            let target = record.describe();
            let parent = match record.kind.root_type_name() {
                Some(root) => root.to_string(),
                None => self
                    .resolver_types
                    .get(&record.target.id)
                    .cloned()
                    .ok_or_else(|| {
                        SchemaError::malformed(&target, "#[resolve] requires #[resolver] on the type")
                    })?,
            };

            if !providers.contains(record.target.id) {
                return Err(SchemaError::malformed(&target, "no factory registered for the type"));
            }

            let Some(spec) = &record.field else {
                return Err(SchemaError::malformed(&target, "missing field metadata"));
            };
            let Some(handler) = &record.handler else {
                return Err(SchemaError::malformed(&target, "missing handler"));
            };
            let wants_stream = record.kind == DeclarationKind::Subscription;
            if handler.is_stream() != wants_stream {
                let message = if wants_stream {
                    "subscriptions must return a stream"
                } else {
                    "only subscriptions may return a stream"
                };
                return Err(SchemaError::malformed(&target, message));
            }

            let path = format!("{parent}.{}", spec.name);
            if spec.returns.trim().is_empty() {
                return Err(SchemaError::malformed(&target, "missing return type"));
            }
            let ty = parse_type(&path, &spec.returns)?;
            let arguments = spec
                .arguments
                .iter()
                .map(|arg| {
                    Ok(ArgDef {
                        name: arg.name.clone(),
                        ty: parse_type(&format!("{path}({})", arg.name), &arg.ty)?,
                        description: arg.description.clone(),
                        default_value: None,
                    })
                })
                .collect::<Result<Vec<_>, SchemaError>>()?;

            let method = record.method_name.clone().unwrap_or_default();
            let roles = self
                .method_roles
                .get(&(record.target.id, method.clone()))
                .or_else(|| self.class_roles.get(&record.target.id))
                .cloned()
                .unwrap_or_default();
            let validator = self.validators.get(&(record.target.id, method)).cloned();

            let field = FieldDef {
                name: spec.name.clone(),
                ty,
                arguments,
                description: spec.description.clone(),
                source: Source::Method(MethodSource {
                    kind: record.kind,
                    target: record.target,
                    handler: handler.clone(),
                    roles,
                    validator,
                    role_checker: self.role_checker.clone(),
                }),
            };

            if record.kind.root_type_name().is_some() && !self.types.contains_key(&parent) {
                self.insert_type(
                    parent.clone(),
                    TypeDef {
                        origin: "root operation type".into(),
                        description: None,
                        shape: Shape::Object(IndexMap::new()),
                    },
                )?;
            }
            match self.types.get_mut(&parent).map(|def| &mut def.shape) {
                Some(Shape::Object(fields)) => insert_field(&parent, fields, field)?,
                _ => {
                    return Err(SchemaError::malformed(
                        &target,
                        format!("'{parent}' is not an object type"),
                    ))
                }
            }
        }
        Ok(())
    }

    fn add_explicit(&mut self, explicit: ExplicitType) -> Result<(), SchemaError> {
        let ExplicitType {
            name,
            description,
            kind,
        } = explicit;

        let shape = match kind {
            ExplicitKind::Object(fields) => {
                let mut defs = IndexMap::new();
                for field in fields {
                    let def = FieldDef {
                        name: field.name,
                        ty: field.ty,
                        arguments: field.arguments.into_iter().map(ArgDef::from).collect(),
                        description: field.description,
                        source: Source::Data,
                    };
                    insert_field(&name, &mut defs, def)?;
                }
                Shape::Object(defs)
            }
            ExplicitKind::Input(fields) => Shape::Input(fields.into_iter().map(ArgDef::from).collect()),
            ExplicitKind::Enum(values) => Shape::Enum(values),
            ExplicitKind::Scalar => Shape::Scalar,
        };

        self.insert_type(
            name,
            TypeDef {
                origin: "type definitions".into(),
                description,
                shape,
            },
        )
    }

    fn kinds(&self) -> HashMap<String, Kind> {
        self.types
            .iter()
            .map(|(name, def)| (name.clone(), def.kind()))
            .collect()
    }

    fn validate(&self) -> Result<(), SchemaError> {
        match self.types.get("Query").map(|def| &def.shape) {
            Some(Shape::Object(fields)) if !fields.is_empty() => {}
            _ => return Err(SchemaError::EmptyQuery),
        }

        let kinds = self.kinds();
        for (type_name, def) in &self.types {
            match &def.shape {
                Shape::Object(fields) => {
                    for field in fields.values() {
                        let path = format!("{type_name}.{}", field.name);
                        check_usage(&kinds, &path, &field.ty, false)?;
                        for arg in &field.arguments {
                            check_usage(&kinds, &format!("{path}({})", arg.name), &arg.ty, true)?;
                        }
                    }
                }
                Shape::Input(fields) => {
                    for field in fields {
                        check_usage(&kinds, &format!("{type_name}.{}", field.name), &field.ty, true)?;
                    }
                }
                Shape::Enum(_) | Shape::Scalar | Shape::Builtin => {}
            }
        }
        Ok(())
    }
}

fn check_usage(
    kinds: &HashMap<String, Kind>,
    field: &str,
    ty: &TypeExpr,
    input: bool,
) -> Result<(), SchemaError> {
    let type_name = ty.base_name();
    let Some(kind) = kinds.get(type_name) else {
        return Err(SchemaError::UnknownType {
            type_name: type_name.to_string(),
            field: field.to_string(),
        });
    };

    let misused = match kind {
        Kind::Input => !input,
        Kind::Object => input,
        Kind::Scalar | Kind::Enum => false,
    };
    if misused {
        return Err(SchemaError::InvalidTypeUsage {
            type_name: type_name.to_string(),
            field: field.to_string(),
            kind: kind.label(),
            expected: if input { "an input" } else { "an output" },
        });
    }
    Ok(())
}

fn parse_type(target: &str, raw: &str) -> Result<TypeExpr, SchemaError> {
    TypeExpr::parse(raw)
        .ok_or_else(|| SchemaError::malformed(target, format!("unparsable type '{raw}'")))
}

fn insert_field(
    type_name: &str,
    fields: &mut IndexMap<String, FieldDef>,
    field: FieldDef,
) -> Result<(), SchemaError> {
    if fields.contains_key(&field.name) {
        return Err(SchemaError::DuplicateField {
            type_name: type_name.to_string(),
            field: field.name,
        });
    }
    fields.insert(field.name.clone(), field);
    Ok(())
}
