use async_graphql::{ErrorExtensions, Value};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Failures detected while compiling declarations into a schema.
///
/// Compilation is all-or-nothing: any of these aborts the build.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Type '{type_name}' is defined more than once ({first} and {second})")]
    DuplicateType {
        type_name: String,
        first: String,
        second: String,
    },

    #[error("Field '{type_name}.{field}' is declared more than once")]
    DuplicateField { type_name: String, field: String },

    #[error("Field '{field}' references unknown type '{type_name}'")]
    UnknownType { type_name: String, field: String },

    #[error("Field '{field}' uses {kind} type '{type_name}' where {expected} type is required")]
    InvalidTypeUsage {
        type_name: String,
        field: String,
        kind: &'static str,
        expected: &'static str,
    },

    #[error("Malformed declaration for {target}: {message}")]
    MalformedDeclaration { target: String, message: String },

    #[error("Schema has no Query fields; declare at least one #[query]")]
    EmptyQuery,

    #[error("Unsupported type definition '{type_name}': {message}")]
    Unsupported { type_name: String, message: String },

    #[error("Failed to parse type definitions: {message}")]
    Parse { message: String },

    #[error("Failed to build GraphQL schema: {message}")]
    Build { message: String },
}

impl SchemaError {
    pub(crate) fn malformed(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedDeclaration {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// One rejected argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Argument validation failed: {}", summary(.violations))]
pub struct ValidationError {
    pub violations: Vec<Violation>,
}

impl ValidationError {
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(vec![Violation::new(field, message)])
    }
}

fn summary(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by a wrapped resolver before, during or after the call.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Access denied: requires one of the roles [{}]", .roles.join(", "))]
    Unauthorized { roles: Vec<String> },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0:#}")]
    Execution(#[source] anyhow::Error),

    #[error("Request scope missing from execution context")]
    ScopeMissing,
}

impl ResolverError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Validation(_) => "BAD_USER_INPUT",
            Self::Execution(_) => "RESOLVER_ERROR",
            Self::ScopeMissing => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::FORBIDDEN,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Execution(_) | Self::ScopeMissing => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ErrorExtensions for ResolverError {
    fn extend(&self) -> async_graphql::Error {
        async_graphql::Error::new(self.to_string()).extend_with(|_, e| {
            e.set("code", self.code());
            e.set("status", self.status_code().as_u16());
            if let Self::Validation(err) = self {
                let violations = serde_json::to_value(&err.violations)
                    .ok()
                    .and_then(|json| Value::from_json(json).ok())
                    .unwrap_or(Value::Null);
                e.set("violations", violations);
            }
        })
    }
}

/// Failures of the per-request capability container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("No provider registered for '{type_name}'")]
    MissingProvider { type_name: &'static str },

    #[error("Failed to construct '{type_name}': {source:#}")]
    Construction {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Provider for '{type_name}' produced a value of another type")]
    TypeMismatch { type_name: &'static str },

    #[error("Request scope {scope_id} has already been released")]
    Released { scope_id: u64 },
}

/// An HTTP-level failure this crate knows how to render.
///
/// The message is written verbatim as the response body.
#[derive(Debug, Clone, Error)]
#[error("{status_code}: {message}")]
pub struct HttpQueryError {
    pub status_code: StatusCode,
    pub headers: HeaderMap,
    pub message: String,
}

impl HttpQueryError {
    pub fn new(status_code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn method_not_allowed(allow: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, message)
            .with_header(axum::http::header::ALLOW, HeaderValue::from_static(allow))
    }

    pub fn with_header(mut self, name: axum::http::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Failures at the HTTP boundary that this crate does not render itself.
///
/// These are handed to the surrounding error-handling layer unchanged.
#[derive(Debug, Error)]
pub enum GraphStackError {
    #[error("Failed to read request body: {0}")]
    Body(#[source] axum::Error),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Failed to resolve request principal: {0:#}")]
    Principal(#[source] anyhow::Error),

    #[error("Failed to serialize GraphQL response: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to build HTTP response: {0}")]
    Http(#[from] axum::http::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framework is already running")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_error_codes() {
        let unauthorized = ResolverError::Unauthorized {
            roles: vec!["admin".into()],
        };
        assert_eq!(unauthorized.code(), "UNAUTHORIZED");
        assert_eq!(unauthorized.status_code(), StatusCode::FORBIDDEN);
        assert!(unauthorized.to_string().contains("admin"));

        let invalid = ResolverError::from(ValidationError::single("name", "is required"));
        assert_eq!(invalid.code(), "BAD_USER_INPUT");
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_validation_error_extensions() {
        let err = ResolverError::from(ValidationError::new(vec![
            Violation::new("name", "is required"),
            Violation::new("qty", "must be at least 1"),
        ]));
        let gql = err.extend();
        let extensions = gql.extensions.expect("extensions are set");
        let violations = extensions.get("violations").expect("violations are set");
        match violations {
            Value::List(items) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
        assert_eq!(
            extensions.get("code"),
            Some(&Value::String("BAD_USER_INPUT".into()))
        );
    }

    #[test]
    fn test_execution_error_keeps_cause() {
        let err = ResolverError::Execution(anyhow::anyhow!("database is down"));
        assert_eq!(err.to_string(), "database is down");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_http_query_error_allow_header() {
        let err = HttpQueryError::method_not_allowed("GET, POST", "Apollo only supports GET and POST");
        assert_eq!(err.status_code, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.headers.get("allow").unwrap(), "GET, POST");
    }
}
