mod axum;
mod http_query;
mod service;

pub use self::axum::{forward_error, router, SubscribePayload, WsMessage};
pub use http_query::{run_http_query, GraphQLRequest, HttpQueryResponse};
pub use service::{graph_stack, GraphStackService, HttpOptions};
