use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue, Method, Request, Response};
use http_body_util::LengthLimitError;
use tower::Service;

use super::http_query::run_http_query;
use crate::auth::PrincipalResolver;
use crate::config::HttpConfig;
use crate::container::Providers;
use crate::error::{GraphStackError, HttpQueryError};
use crate::loader::BoxFuture;
use crate::schema::SchemaHandle;
use crate::scope::CurrentRequest;

#[derive(Clone)]
pub struct HttpOptions {
    /// Derives the principal of each request. Requests are anonymous without one.
    pub principal_resolver: Option<Arc<dyn PrincipalResolver>>,
    /// Values merged into every request scope, resolvable like any provider.
    pub context: Option<Arc<Providers>>,
    pub batching: bool,
    pub max_batch_size: usize,
    pub body_limit: usize,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self::from_config(&HttpConfig::default())
    }
}

impl HttpOptions {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            principal_resolver: None,
            context: None,
            batching: config.batching,
            max_batch_size: config.max_batch_size,
            body_limit: config.body_limit,
        }
    }

    pub fn principal_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.principal_resolver = Some(resolver);
        self
    }

    pub fn context(mut self, context: Providers) -> Self {
        self.context = Some(Arc::new(context));
        self
    }
}

impl fmt::Debug for HttpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpOptions")
            .field("principal_resolver", &self.principal_resolver.is_some())
            .field("context", &self.context)
            .field("batching", &self.batching)
            .field("max_batch_size", &self.max_batch_size)
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

/// Serves GraphQL over HTTP with one [`RequestScope`](crate::RequestScope)
/// per request.
///
/// Failures it knows how to render ([`HttpQueryError`]) become responses;
/// anything else is returned as the service error for the surrounding
/// error-handling layer.
#[derive(Clone)]
pub struct GraphStackService {
    schema: SchemaHandle,
    options: Arc<HttpOptions>,
}

pub fn graph_stack(schema: impl Into<SchemaHandle>, options: HttpOptions) -> GraphStackService {
    GraphStackService {
        schema: schema.into(),
        options: Arc::new(options),
    }
}

impl GraphStackService {
    pub fn schema(&self) -> &SchemaHandle {
        &self.schema
    }

    async fn handle(self, request: Request<Body>) -> Result<Response<Body>, GraphStackError> {
        let (parts, body) = request.into_parts();
        let current = CurrentRequest::from_parts(&parts);

        let principal = match &self.options.principal_resolver {
            Some(resolver) => resolver
                .resolve(&current)
                .await
                .map_err(GraphStackError::Principal)?,
            None => None,
        };

        let body = if parts.method == Method::POST {
            axum::body::to_bytes(body, self.options.body_limit)
                .await
                .map_err(|err| body_error(err, self.options.body_limit))?
        } else {
            Bytes::new()
        };

        let schema = self.schema.load();
        let scope = schema
            .scope()
            .request(current)
            .principal(principal)
            .context(self.options.context.clone())
            .build();
        let _guard = scope.guard();

        let outcome = run_http_query(
            &schema,
            &scope,
            &parts.method,
            &parts.uri,
            &body,
            &self.options,
        )
        .await;

        match outcome {
            Ok(reply) => {
                let payload = serde_json::to_vec(&reply.body)?;
                let mut response = Response::builder()
                    .status(reply.status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::CONTENT_LENGTH, payload.len())
                    .body(Body::from(payload))?;
                scope.response().apply(&mut response);
                Ok(response)
            }
            Err(err) => {
                tracing::debug!(
                    status = %err.status_code,
                    message = %err.message,
                    "GraphQL HTTP request rejected"
                );
                Ok(render_http_error(err))
            }
        }
    }
}

fn render_http_error(err: HttpQueryError) -> Response<Body> {
    let mut response = Response::new(Body::from(err.message));
    *response.status_mut() = err.status_code;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    for (name, value) in &err.headers {
        headers.insert(name.clone(), value.clone());
    }
    response
}

impl Service<Request<Body>> for GraphStackService {
    type Response = Response<Body>;
    type Error = GraphStackError;
    type Future = BoxFuture<'static, Result<Response<Body>, GraphStackError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let this = self.clone();
        Box::pin(this.handle(request))
    }
}

fn body_error(err: axum::Error, limit: usize) -> GraphStackError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return GraphStackError::PayloadTooLarge { limit };
        }
        source = current.source();
    }
    GraphStackError::Body(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{HeaderPrincipalResolver, Principal};
    use crate::compiler::{SchemaBuilder, SchemaBuilderOptions};
    use crate::container::Factory;
    use crate::handler::{Handler, Invocation};
    use crate::registry::{DeclarationRecord, Registry};
    use crate::scope::CurrentResponse;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Api;

    struct Tenant(&'static str);

    fn schema() -> SchemaHandle {
        let mut registry = Registry::new();
        registry.register(DeclarationRecord::controller::<Api>(Factory::from_default::<Api>()));
        registry.register(
            DeclarationRecord::query::<Api>("ping")
                .returns("String!")
                .handler(Handler::field(|_this: Arc<Api>, call: Invocation| async move {
                    let response = call.inject::<CurrentResponse>()?;
                    response.insert_header(
                        header::CACHE_CONTROL,
                        HeaderValue::from_static("no-store"),
                    );
                    Ok::<_, anyhow::Error>("pong")
                })),
        );
        registry.register(
            DeclarationRecord::query::<Api>("whoami")
                .returns("String")
                .handler(Handler::field(|_this: Arc<Api>, call: Invocation| async move {
                    Ok::<_, anyhow::Error>(call.principal().map(|p: &Principal| p.id.clone()))
                })),
        );
        registry.register(
            DeclarationRecord::query::<Api>("secret")
                .returns("String!")
                .handler(Handler::field(|_this: Arc<Api>, _call: Invocation| async move {
                    Ok::<_, anyhow::Error>("classified")
                })),
        );
        registry.register(DeclarationRecord::authorized::<Api, _>(Some("secret"), ["admin"]));
        registry.register(
            DeclarationRecord::query::<Api>("tenant")
                .returns("String!")
                .handler(Handler::field(|_this: Arc<Api>, call: Invocation| async move {
                    let tenant = call.inject::<Tenant>()?;
                    Ok::<_, anyhow::Error>(tenant.0)
                })),
        );
        SchemaBuilder::new(SchemaBuilderOptions::default())
            .build(&registry)
            .unwrap()
            .into()
    }

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/graphql")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_post_query() {
        let service = graph_stack(schema(), HttpOptions::default());
        let response = service.oneshot(post(r#"{"query":"{ ping }"}"#)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        let length: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_text(response).await;
        assert_eq!(body.len(), length);
        assert_eq!(body, r#"{"data":{"ping":"pong"}}"#);
    }

    #[tokio::test]
    async fn test_get_query() {
        let service = graph_stack(schema(), HttpOptions::default());
        let request = Request::builder()
            .uri("/graphql?query=%7B%20ping%20%7D")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, r#"{"data":{"ping":"pong"}}"#);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let service = graph_stack(schema(), HttpOptions::default());
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/graphql")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST");
    }

    #[tokio::test]
    async fn test_request_level_errors_are_bad_request() {
        let service = graph_stack(schema(), HttpOptions::default());
        let response = service
            .clone()
            .oneshot(post(r#"{"query":"{ nonexistent }"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(json["errors"].is_array());

        let response = service.oneshot(post("{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Must provide query string.");
    }

    #[tokio::test]
    async fn test_failed_root_field_is_not_a_request_error() {
        let service = graph_stack(schema(), HttpOptions::default());
        let response = service.oneshot(post(r#"{"query":"{ secret }"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["data"], serde_json::Value::Null);
        assert_eq!(json["errors"][0]["extensions"]["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_context_values_reach_resolvers() {
        let mut context = Providers::new();
        context.singleton(Tenant("acme"));
        let service = graph_stack(schema(), HttpOptions::default().context(context));
        let response = service.oneshot(post(r#"{"query":"{ tenant }"}"#)).await.unwrap();
        assert_eq!(body_text(response).await, r#"{"data":{"tenant":"acme"}}"#);

        let service = graph_stack(schema(), HttpOptions::default());
        let response = service.oneshot(post(r#"{"query":"{ tenant }"}"#)).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert!(json["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains("Tenant"));
    }

    #[tokio::test]
    async fn test_principal_from_headers() {
        let options = HttpOptions::default().principal_resolver(Arc::new(HeaderPrincipalResolver::default()));
        let service = graph_stack(schema(), options);
        let mut request = post(r#"{"query":"{ whoami }"}"#);
        request
            .headers_mut()
            .insert("x-principal-id", HeaderValue::from_static("alice"));
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(body_text(response).await, r#"{"data":{"whoami":"alice"}}"#);
    }

    #[tokio::test]
    async fn test_unrecognized_errors_are_forwarded() {
        struct Failing;
        impl PrincipalResolver for Failing {
            fn resolve<'a>(
                &'a self,
                _request: &'a CurrentRequest,
            ) -> BoxFuture<'a, anyhow::Result<Option<Principal>>> {
                Box::pin(async { Err(anyhow::anyhow!("token service unavailable")) })
            }
        }

        let service = graph_stack(schema(), HttpOptions::default().principal_resolver(Arc::new(Failing)));
        match service.oneshot(post(r#"{"query":"{ ping }"}"#)).await {
            Err(GraphStackError::Principal(err)) => {
                assert!(err.to_string().contains("token service"))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected the error to be forwarded"),
        }
    }

    #[tokio::test]
    async fn test_oversized_body_is_reported() {
        let options = HttpOptions {
            body_limit: 16,
            ..HttpOptions::default()
        };
        let service = graph_stack(schema(), options);
        match service.oneshot(post(r#"{"query":"{ ping ping ping }"}"#)).await {
            Err(GraphStackError::PayloadTooLarge { limit }) => assert_eq!(limit, 16),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected the body to be rejected"),
        }
    }

    #[tokio::test]
    async fn test_batched_post() {
        let options = HttpOptions {
            batching: true,
            ..HttpOptions::default()
        };
        let service = graph_stack(schema(), options);
        let response = service
            .oneshot(post(r#"[{"query":"{ ping }"},{"query":"{ whoami }"}]"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            r#"[{"data":{"ping":"pong"}},{"data":{"whoami":null}}]"#
        );
    }
}
