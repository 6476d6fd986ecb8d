use std::collections::HashMap;
use std::sync::Arc;

use async_graphql::http::GraphiQLSource;
use async_graphql::{Response as GraphQLResponse, Variables};
use axum::{
    error_handling::HandleError,
    extract::{
        ws::{Message, WebSocket},
        Query, Request, State, WebSocketUpgrade,
    },
    http::{header, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};

use super::http_query::is_request_error;
use super::service::{graph_stack, GraphStackService, HttpOptions};
use crate::auth::Principal;
use crate::config::FrameworkConfig;
use crate::error::GraphStackError;
use crate::schema::SchemaHandle;
use crate::scope::CurrentRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    ConnectionInit {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Next {
        id: String,
        payload: serde_json::Value,
    },
    Error {
        id: String,
        payload: serde_json::Value,
    },
    Complete {
        id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

struct AppState {
    schema: SchemaHandle,
    service: GraphStackService,
    options: HttpOptions,
    path: String,
    playground: bool,
}

/// Routes GraphQL (GET, POST, WebSocket) on `config.path` and a health check
/// on `config.health_path`.
pub fn router(schema: SchemaHandle, config: &FrameworkConfig, options: HttpOptions) -> Router {
    let service = graph_stack(schema.clone(), options.clone());
    let state = Arc::new(AppState {
        schema,
        service: service.clone(),
        options,
        path: config.path.clone(),
        playground: config.playground,
    });

    let graphql = get(graphql_get_handler).fallback_service(HandleError::new(service, forward_error));
    let router = Router::new()
        .route(&config.path, graphql)
        .route(&config.health_path, get(health_handler))
        .with_state(state);

    if config.cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::AUTHORIZATION]);
        router.layer(cors)
    } else {
        router
    }
}

/// Renders errors the GraphQL service could not handle itself.
pub async fn forward_error(err: GraphStackError) -> (StatusCode, String) {
    match err {
        GraphStackError::Body(err) => {
            tracing::warn!(error = %err, "failed to read GraphQL request body");
            (StatusCode::BAD_REQUEST, "Failed to read request body.".to_string())
        }
        GraphStackError::PayloadTooLarge { limit } => {
            tracing::warn!(limit, "GraphQL request body too large");
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Request body exceeds {limit} bytes."),
            )
        }
        other => {
            tracing::error!(error = %other, "GraphQL request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error".to_string(),
            )
        }
    }
}

#[derive(Deserialize)]
struct QueryProbe {
    query: Option<String>,
}

fn carries_query(request: &Request) -> bool {
    Query::<QueryProbe>::try_from_uri(request.uri())
        .map(|Query(params)| params.query.is_some())
        .unwrap_or(true)
}

async fn resolve_principal(
    options: &HttpOptions,
    request: &CurrentRequest,
) -> Result<Option<Principal>, GraphStackError> {
    match &options.principal_resolver {
        Some(resolver) => resolver
            .resolve(request)
            .await
            .map_err(GraphStackError::Principal),
        None => Ok(None),
    }
}

async fn graphql_get_handler(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    if let Some(ws) = ws {
        let current = CurrentRequest::new(
            request.method().clone(),
            request.uri().clone(),
            request.headers().clone(),
        );
        let principal = match resolve_principal(&state.options, &current).await {
            Ok(principal) => principal,
            Err(err) => return forward_error(err).await.into_response(),
        };
        return ws
            .protocols(["graphql-transport-ws"])
            .on_upgrade(move |socket| handle_socket(socket, state, current, principal))
            .into_response();
    }

    if state.playground && !carries_query(&request) {
        let page = GraphiQLSource::build()
            .endpoint(&state.path)
            .subscription_endpoint(&state.path)
            .finish();
        return Html(page).into_response();
    }

    match state.service.clone().oneshot(request).await {
        Ok(response) => response,
        Err(err) => forward_error(err).await.into_response(),
    }
}

async fn send(tx: &mpsc::Sender<Message>, message: &WsMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => tx.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode WebSocket message");
            false
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    request: CurrentRequest,
    principal: Option<Principal>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(32);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut initialized = false;
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(result) = receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        let message: WsMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "invalid WebSocket message");
                let _ = tx
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 4400,
                        reason: "Invalid message".into(),
                    })))
                    .await;
                break;
            }
        };

        match message {
            WsMessage::ConnectionInit { .. } => {
                initialized = true;
                send(&tx, &WsMessage::ConnectionAck { payload: None }).await;
            }

            WsMessage::Ping { payload } => {
                send(&tx, &WsMessage::Pong { payload }).await;
            }

            WsMessage::Subscribe { id, payload } if initialized => {
                let schema = state.schema.load();
                let scope = schema
                    .scope()
                    .request(request.clone())
                    .principal(principal.clone())
                    .context(state.options.context.clone())
                    .build();
                let stream = schema.execute_stream(subscription_request(payload), scope);
                let handle = tokio::spawn(forward_responses(stream, id.clone(), tx.clone()));
                track_subscription(&mut subscriptions, id, handle);
            }

            WsMessage::Subscribe { .. } => {
                let _ = tx
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: 4401,
                        reason: "Unauthorized".into(),
                    })))
                    .await;
                break;
            }

            WsMessage::Complete { id } => {
                if let Some(handle) = subscriptions.remove(&id) {
                    handle.abort();
                }
            }

            _ => {}
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    drop(tx);
    let _ = send_task.await;
}

/// Replaces any subscription under the same id and forgets finished ones.
fn track_subscription(
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    id: String,
    handle: JoinHandle<()>,
) {
    if let Some(previous) = subscriptions.remove(&id) {
        previous.abort();
    }
    subscriptions.retain(|_, running| !running.is_finished());
    subscriptions.insert(id, handle);
}

fn subscription_request(payload: SubscribePayload) -> async_graphql::Request {
    let mut request = async_graphql::Request::new(payload.query);
    if let Some(variables) = payload.variables {
        request = request.variables(Variables::from_json(variables));
    }
    if let Some(name) = payload.operation_name {
        request = request.operation_name(name);
    }
    request
}

async fn forward_responses(
    mut stream: futures_util::stream::BoxStream<'static, GraphQLResponse>,
    id: String,
    tx: mpsc::Sender<Message>,
) {
    while let Some(response) = stream.next().await {
        let rejected = is_request_error(&response);

        let message = if rejected {
            WsMessage::Error {
                id: id.clone(),
                payload: serde_json::to_value(&response.errors).unwrap_or_default(),
            }
        } else {
            WsMessage::Next {
                id: id.clone(),
                payload: serde_json::to_value(&response).unwrap_or_default(),
            }
        };

        if !send(&tx, &message).await {
            return;
        }
        if rejected {
            return;
        }
    }

    send(&tx, &WsMessage::Complete { id }).await;
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{SchemaBuilder, SchemaBuilderOptions};
    use crate::container::Factory;
    use crate::handler::{Handler, Invocation};
    use crate::registry::{DeclarationRecord, Registry};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use hyper::Request;

    #[derive(Default)]
    struct Hello;

    fn app(config: &FrameworkConfig) -> Router {
        let mut registry = Registry::new();
        registry.register(DeclarationRecord::controller::<Hello>(Factory::from_default::<Hello>()));
        registry.register(
            DeclarationRecord::query::<Hello>("greet")
                .returns("String!")
                .argument("name", "String!")
                .handler(Handler::field(|_this: Arc<Hello>, call: Invocation| async move {
                    let name: String = call.arg("name")?;
                    Ok::<_, anyhow::Error>(format!("Hello, {name}!"))
                })),
        );
        let schema = SchemaBuilder::new(SchemaBuilderOptions::default())
            .build(&registry)
            .unwrap();
        router(schema.into(), config, HttpOptions::default())
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_post_through_router() {
        let app = app(&FrameworkConfig::default());
        let request = Request::builder()
            .method("POST")
            .uri("/graphql")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "{ greet(name: \"Alice\") }"}"#))
            .unwrap();
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["data"]["greet"], "Hello, Alice!");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = app(&FrameworkConfig::default());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_playground_returns_html() {
        let app = app(&FrameworkConfig::default());
        let request = Request::builder()
            .uri("/graphql")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.to_lowercase().contains("graphiql"));
    }

    #[tokio::test]
    async fn test_disabled_playground_requires_query() {
        let config = FrameworkConfig {
            playground: false,
            ..FrameworkConfig::default()
        };
        let app = app(&config);
        let request = Request::builder()
            .uri("/graphql")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Must provide query string.");
    }

    #[tokio::test]
    async fn test_other_methods_are_rejected() {
        let app = app(&FrameworkConfig::default());
        let request = Request::builder()
            .method("DELETE")
            .uri("/graphql")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(&app, request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_forward_error_hides_internal_details() {
        let (status, body) =
            forward_error(GraphStackError::Principal(anyhow::anyhow!("secret detail"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains("secret"));
    }

    #[tokio::test]
    async fn test_forward_error_reports_oversized_body() {
        let (status, body) = forward_error(GraphStackError::PayloadTooLarge { limit: 1024 }).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body, "Request body exceeds 1024 bytes.");
    }

    #[tokio::test]
    async fn test_finished_subscriptions_are_pruned() {
        let mut subscriptions = HashMap::new();
        let done = tokio::spawn(async {});
        while !done.is_finished() {
            tokio::task::yield_now().await;
        }
        track_subscription(&mut subscriptions, "1".into(), done);

        let pending = tokio::spawn(futures_util::future::pending::<()>());
        track_subscription(&mut subscriptions, "2".into(), pending);
        assert_eq!(subscriptions.len(), 1);
        assert!(subscriptions.contains_key("2"));

        let replacement = tokio::spawn(futures_util::future::pending::<()>());
        track_subscription(&mut subscriptions, "2".into(), replacement);
        assert_eq!(subscriptions.len(), 1);
        for (_, handle) in subscriptions {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_resolver_errors_are_sent_as_next() {
        let mut extensions = async_graphql::ErrorExtensionValues::default();
        extensions.set("code", "UNAUTHORIZED");
        let mut denied = async_graphql::ServerError::new("Access denied", None);
        denied.extensions = Some(extensions);
        let rejected = async_graphql::ServerError::new("Unknown field \"nope\"", None);

        let stream = futures_util::stream::iter(vec![GraphQLResponse::from_errors(vec![denied])]).boxed();
        let (tx, mut rx) = mpsc::channel(8);
        forward_responses(stream, "a".into(), tx).await;
        let kinds: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|message| match message {
                Message::Text(text) => serde_json::from_str::<serde_json::Value>(&text).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(kinds, ["next", "complete"]);

        let stream = futures_util::stream::iter(vec![GraphQLResponse::from_errors(vec![rejected])]).boxed();
        let (tx, mut rx) = mpsc::channel(8);
        forward_responses(stream, "b".into(), tx).await;
        let Ok(Message::Text(text)) = rx.try_recv() else {
            panic!("expected an error message");
        };
        assert!(text.contains(r#""type":"error""#));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ws_message_subscribe_deserialization() {
        let json = r#"{
            "type": "subscribe",
            "id": "1",
            "payload": {
                "query": "subscription { counter }"
            }
        }"#;

        let msg: WsMessage = serde_json::from_str(json).unwrap();
        match msg {
            WsMessage::Subscribe { id, payload } => {
                assert_eq!(id, "1");
                assert_eq!(payload.query, "subscription { counter }");
            }
            _ => panic!("Expected Subscribe message"),
        }
    }

    #[test]
    fn test_ws_message_serialization() {
        let ack = serde_json::to_string(&WsMessage::ConnectionAck { payload: None }).unwrap();
        assert_eq!(ack, r#"{"type":"connection_ack"}"#);

        let complete = serde_json::to_string(&WsMessage::Complete { id: "sub-1".into() }).unwrap();
        assert!(complete.contains("complete"));
        assert!(complete.contains("sub-1"));
    }
}
