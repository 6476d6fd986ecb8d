//! Turns an HTTP request into GraphQL operations and back.
//!
//! Status handling: anything but GET or POST is 405 with an `Allow` header,
//! a missing query or malformed JSON/variables is 400, a mutation sent over
//! GET is 405, and a response that failed before any resolver ran (parse,
//! validation or limit errors) is 400. Field errors still answer 200.

use async_graphql::{BatchResponse, Request, Response, ServerError, Variables};
use async_graphql_parser::types::{DocumentOperations, OperationType};
use axum::extract::Query;
use axum::http::{Method, StatusCode, Uri};
use serde::Deserialize;

use crate::error::HttpQueryError;
use crate::schema::CompiledSchema;
use crate::scope::RequestScope;

use super::service::HttpOptions;

/// One operation as sent by a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphQLRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

/// GET parameters carry variables as a JSON string.
#[derive(Debug, Default, Deserialize)]
struct GetParams {
    query: Option<String>,
    variables: Option<String>,
    #[serde(rename = "operationName")]
    operation_name: Option<String>,
}

#[derive(Debug)]
pub struct HttpQueryResponse {
    pub status: StatusCode,
    pub body: BatchResponse,
}

pub async fn run_http_query(
    schema: &CompiledSchema,
    scope: &RequestScope,
    method: &Method,
    uri: &Uri,
    body: &[u8],
    options: &HttpOptions,
) -> Result<HttpQueryResponse, HttpQueryError> {
    let (requests, batched) = match *method {
        Method::GET => (vec![parse_get(uri)?], false),
        Method::POST => parse_post(body, options)?,
        _ => {
            return Err(HttpQueryError::method_not_allowed(
                "GET, POST",
                "GraphQL only supports GET and POST requests.",
            ))
        }
    };

    let mut prepared = Vec::with_capacity(requests.len());
    for request in requests {
        let is_get = *method == Method::GET;
        prepared.push(prepare(request, is_get)?);
    }

    if batched {
        let mut responses = Vec::with_capacity(prepared.len());
        for request in prepared {
            responses.push(schema.execute_in(request, scope).await);
        }
        return Ok(HttpQueryResponse {
            status: StatusCode::OK,
            body: BatchResponse::Batch(responses),
        });
    }

    let mut prepared = prepared.into_iter();
    let request = prepared
        .next()
        .ok_or_else(|| HttpQueryError::bad_request("Must provide query string."))?;
    let response = schema.execute_in(request, scope).await;
    let status = if is_request_error(&response) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok(HttpQueryResponse {
        status,
        body: BatchResponse::Single(response),
    })
}

fn parse_get(uri: &Uri) -> Result<GraphQLRequest, HttpQueryError> {
    let Query(params) = Query::<GetParams>::try_from_uri(uri)
        .map_err(|err| HttpQueryError::bad_request(format!("Invalid query string: {err}")))?;

    let variables = params
        .variables
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|_| HttpQueryError::bad_request("Variables are invalid JSON."))
        })
        .transpose()?;

    Ok(GraphQLRequest {
        query: params.query,
        variables,
        operation_name: params.operation_name,
    })
}

fn parse_post(body: &[u8], options: &HttpOptions) -> Result<(Vec<GraphQLRequest>, bool), HttpQueryError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| HttpQueryError::bad_request("POST body sent invalid JSON."))?;

    match value {
        serde_json::Value::Array(items) => {
            if !options.batching {
                return Err(HttpQueryError::bad_request("Batched requests are not enabled."));
            }
            if items.is_empty() {
                return Err(HttpQueryError::bad_request("Batch must contain at least one operation."));
            }
            if items.len() > options.max_batch_size {
                return Err(HttpQueryError::bad_request(format!(
                    "Batch exceeds the maximum of {} operations.",
                    options.max_batch_size
                )));
            }
            let requests = items
                .into_iter()
                .map(operation)
                .collect::<Result<Vec<_>, _>>()?;
            Ok((requests, true))
        }
        value @ serde_json::Value::Object(_) => Ok((vec![operation(value)?], false)),
        _ => Err(HttpQueryError::bad_request(
            "POST body must be a JSON object or array.",
        )),
    }
}

fn operation(value: serde_json::Value) -> Result<GraphQLRequest, HttpQueryError> {
    serde_json::from_value(value)
        .map_err(|err| HttpQueryError::bad_request(format!("Invalid GraphQL request: {err}")))
}

fn prepare(request: GraphQLRequest, is_get: bool) -> Result<Request, HttpQueryError> {
    let query = match request.query {
        Some(query) if !query.trim().is_empty() => query,
        _ => return Err(HttpQueryError::bad_request("Must provide query string.")),
    };

    if is_get && is_mutation(&query, request.operation_name.as_deref()) {
        return Err(HttpQueryError::method_not_allowed(
            "POST",
            "Can only perform a mutation operation from a POST request.",
        ));
    }

    let mut prepared = Request::new(query);
    match request.variables {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::String(raw)) => {
            let parsed: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|_| HttpQueryError::bad_request("Variables are invalid JSON."))?;
            prepared = prepared.variables(variables(parsed)?);
        }
        Some(value) => prepared = prepared.variables(variables(value)?),
    }
    if let Some(name) = request.operation_name {
        prepared = prepared.operation_name(name);
    }
    Ok(prepared)
}

fn variables(value: serde_json::Value) -> Result<Variables, HttpQueryError> {
    match value {
        serde_json::Value::Object(_) => Ok(Variables::from_json(value)),
        serde_json::Value::Null => Ok(Variables::default()),
        _ => Err(HttpQueryError::bad_request("Variables are invalid JSON.")),
    }
}

/// Unparsable documents are left for the engine to report.
fn is_mutation(query: &str, operation_name: Option<&str>) -> bool {
    let Ok(document) = async_graphql_parser::parse_query(query) else {
        return false;
    };
    let ty = match (&document.operations, operation_name) {
        (DocumentOperations::Single(op), _) => Some(op.node.ty),
        (DocumentOperations::Multiple(ops), Some(name)) => ops
            .iter()
            .find(|(op_name, _)| op_name.as_str() == name)
            .map(|(_, op)| op.node.ty),
        (DocumentOperations::Multiple(_), None) => None,
    };
    ty == Some(OperationType::Mutation)
}

/// The engine reports root resolver errors without a path, so a null `data`
/// alone does not tell a rejected request from a failed non-null field.
pub(super) fn is_request_error(response: &Response) -> bool {
    response.data == async_graphql::Value::Null
        && !response.errors.is_empty()
        && response
            .errors
            .iter()
            .all(|err| err.path.is_empty() && !raised_by_resolver(err))
}

/// Wrapped resolvers always attach a `code` extension.
fn raised_by_resolver(err: &ServerError) -> bool {
    err.extensions
        .as_ref()
        .is_some_and(|extensions| extensions.get("code").is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> HttpOptions {
        HttpOptions::default()
    }

    #[test]
    fn test_parse_get_params() {
        let uri: Uri = "/graphql?query=%7B%20ping%20%7D&variables=%7B%22a%22%3A1%7D&operationName=Ping"
            .parse()
            .unwrap();
        let request = parse_get(&uri).unwrap();
        assert_eq!(request.query.as_deref(), Some("{ ping }"));
        assert_eq!(request.variables, Some(serde_json::json!({ "a": 1 })));
        assert_eq!(request.operation_name.as_deref(), Some("Ping"));

        let uri: Uri = "/graphql?query=%7Bping%7D&variables=nope".parse().unwrap();
        let err = parse_get(&uri).unwrap_err();
        assert_eq!(err.status_code, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Variables are invalid JSON.");
    }

    #[test]
    fn test_parse_post_bodies() {
        let (requests, batched) = parse_post(br#"{"query":"{ ping }"}"#, &options()).unwrap();
        assert_eq!(requests.len(), 1);
        assert!(!batched);

        let err = parse_post(b"{not json", &options()).unwrap_err();
        assert_eq!(err.message, "POST body sent invalid JSON.");

        let err = parse_post(br#"[{"query":"{ ping }"}]"#, &options()).unwrap_err();
        assert_eq!(err.status_code, StatusCode::BAD_REQUEST);

        let batching = HttpOptions {
            batching: true,
            max_batch_size: 2,
            ..HttpOptions::default()
        };
        let (requests, batched) =
            parse_post(br#"[{"query":"{ a }"},{"query":"{ b }"}]"#, &batching).unwrap();
        assert_eq!(requests.len(), 2);
        assert!(batched);
        assert!(parse_post(br#"[{"query":"{ a }"},{"query":"{ b }"},{"query":"{ c }"}]"#, &batching).is_err());
    }

    #[test]
    fn test_prepare_requires_query() {
        let err = prepare(GraphQLRequest::default(), false).unwrap_err();
        assert_eq!(err.message, "Must provide query string.");
    }

    #[test]
    fn test_mutation_over_get_is_rejected() {
        let request = GraphQLRequest {
            query: Some("mutation { createItem(name: \"x\") { id } }".into()),
            ..GraphQLRequest::default()
        };
        let err = prepare(request.clone(), true).unwrap_err();
        assert_eq!(err.status_code, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(err.headers.get("allow").unwrap(), "POST");
        assert!(prepare(request, false).is_ok());
    }

    #[test]
    fn test_operation_selection_for_mutation_check() {
        let query = "query A { ping } mutation B { reset }";
        assert!(!is_mutation(query, Some("A")));
        assert!(is_mutation(query, Some("B")));
        assert!(!is_mutation(query, None));
        assert!(!is_mutation("{ broken", None));
    }

    #[test]
    fn test_string_variables_are_decoded() {
        let request = GraphQLRequest {
            query: Some("query($a: Int) { echo(a: $a) }".into()),
            variables: Some(serde_json::Value::String("{\"a\": 2}".into())),
            operation_name: None,
        };
        assert!(prepare(request, false).is_ok());

        let request = GraphQLRequest {
            query: Some("{ ping }".into()),
            variables: Some(serde_json::json!([1, 2])),
            operation_name: None,
        };
        assert_eq!(
            prepare(request, false).unwrap_err().message,
            "Variables are invalid JSON."
        );
    }
}
