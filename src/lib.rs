//! Declarative GraphQL for Rust.
//!
//! Controllers and resolvers describe their GraphQL surface as
//! [`DeclarationRecord`]s (usually through the [`controller`] and
//! [`resolver`] attributes). A [`SchemaBuilder`] compiles a [`Registry`] of
//! records plus optional SDL into an executable [`CompiledSchema`], and every
//! execution runs inside its own [`RequestScope`].

extern crate self as graphstack;

pub mod auth;
pub mod compiler;
pub mod config;
pub mod container;
pub mod error;
pub mod framework;
pub mod handler;
pub mod loader;
pub mod registry;
pub mod schema;
pub mod scope;
pub mod server;
pub mod validation;
pub mod wrapper;

pub use async_graphql_value::ConstValue;
pub use auth::{
    Action, AllRolesChecker, AnyRoleChecker, HeaderPrincipalResolver, Principal,
    PrincipalResolver, RoleChecker,
};
pub use compiler::{GraphModule, SchemaBuilder, SchemaBuilderOptions, TypeExpr};
pub use config::{FrameworkConfig, HttpConfig, SchemaConfig};
pub use container::{Container, Factory, Providers};
pub use error::{
    ConfigError, ContainerError, Error, GraphStackError, HttpQueryError, ResolverError, Result,
    SchemaError, ValidationError, Violation,
};
pub use framework::{bootstrap, build_schema, Framework, FrameworkOptions};
pub use handler::{Args, FieldInfo, Handler, Invocation};
pub use loader::{BatchLoader, BoxFuture, DataLoaders};
pub use registry::{
    global_registry, register, register_record, DeclarationKind, DeclarationRecord, Declarations,
    Registry,
};
pub use schema::{CompiledSchema, SchemaHandle};
pub use scope::{CurrentRequest, CurrentResponse, RequestScope, ScopeBuilder, ScopeGuard};
pub use server::{graph_stack, router, GraphStackService, HttpOptions};
pub use validation::{validator_fn, ArgsValidator, Rule, Rules};
pub use wrapper::{CompiledField, OutputKind};

pub use graphstack_macros::{controller, resolver};

#[doc(hidden)]
pub mod __private {
    pub use anyhow;
}
