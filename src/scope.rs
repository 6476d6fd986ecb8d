//! Per-request state: the scoped container, data loaders, principal and the
//! request/response handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axum::http::{request, HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, Uri};

use crate::auth::Principal;
use crate::container::{Container, Providers};
use crate::loader::DataLoaders;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Head of the HTTP request being served.
#[derive(Debug, Clone)]
pub struct CurrentRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl CurrentRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
        }
    }

    pub fn from_parts(parts: &request::Parts) -> Self {
        Self::new(parts.method.clone(), parts.uri.clone(), parts.headers.clone())
    }

    /// Header value as text; non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

#[derive(Debug, Default)]
struct ResponseHead {
    status: Option<StatusCode>,
    headers: HeaderMap,
}

/// Response head resolvers may adjust; applied when the response is written.
#[derive(Debug, Clone, Default)]
pub struct CurrentResponse {
    head: Arc<Mutex<ResponseHead>>,
}

impl CurrentResponse {
    pub fn set_status(&self, status: StatusCode) {
        self.lock().status = Some(status);
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.lock().headers.insert(name, value);
    }

    pub fn headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    pub fn apply<B>(&self, response: &mut Response<B>) {
        let head = self.lock();
        if let Some(status) = head.status {
            *response.status_mut() = status;
        }
        for (name, value) in &head.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResponseHead> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ScopeInner {
    id: u64,
    container: Container,
    loaders: DataLoaders,
    principal: Option<Principal>,
    request: Option<CurrentRequest>,
    response: CurrentResponse,
    released: AtomicBool,
}

/// Everything that lives exactly as long as one request.
///
/// Cloning shares the same scope. The scope is embedded in the engine request
/// and looked up by every wrapped resolver.
#[derive(Clone)]
pub struct RequestScope {
    inner: Arc<ScopeInner>,
}

impl RequestScope {
    /// A scope detached from any HTTP request.
    pub fn new(providers: Arc<Providers>) -> Self {
        Self::builder(providers).build()
    }

    pub fn builder(providers: Arc<Providers>) -> ScopeBuilder {
        ScopeBuilder {
            providers,
            request: None,
            response: CurrentResponse::default(),
            principal: None,
            context: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn loaders(&self) -> &DataLoaders {
        &self.inner.loaders
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.inner.principal.as_ref()
    }

    pub fn request(&self) -> Option<&CurrentRequest> {
        self.inner.request.as_ref()
    }

    pub fn response(&self) -> &CurrentResponse {
        &self.inner.response
    }

    /// Empties the container and the loader cache. Returns `false` if the
    /// scope was already released.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let instances = self.inner.container.clear();
        let loaders = self.inner.loaders.clear();
        tracing::debug!(scope_id = self.inner.id, instances, loaders, "request scope released");
        true
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Releases the scope when dropped, including when the request future is
    /// dropped mid-flight.
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard {
            scope: self.clone(),
        }
    }
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("id", &self.inner.id)
            .field("principal", &self.inner.principal)
            .field("released", &self.is_released())
            .finish()
    }
}

pub struct ScopeBuilder {
    providers: Arc<Providers>,
    request: Option<CurrentRequest>,
    response: CurrentResponse,
    principal: Option<Principal>,
    context: Option<Arc<Providers>>,
}

impl ScopeBuilder {
    pub fn request(mut self, request: CurrentRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn response(mut self, response: CurrentResponse) -> Self {
        self.response = response;
        self
    }

    pub fn principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    /// Values every resolver in the scope can inject, ahead of the schema's
    /// providers.
    pub fn context(mut self, context: Option<Arc<Providers>>) -> Self {
        self.context = context;
        self
    }

    pub fn build(self) -> RequestScope {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        let container = Container::with_context(id, self.providers, self.context);
        if let Some(request) = &self.request {
            container.set(request.clone());
        }
        container.set(self.response.clone());
        if let Some(principal) = &self.principal {
            container.set(principal.clone());
        }
        tracing::debug!(
            scope_id = id,
            principal = self.principal.as_ref().map(|p| p.id.as_str()),
            "request scope created"
        );

        RequestScope {
            inner: Arc::new(ScopeInner {
                id,
                container,
                loaders: DataLoaders::new(),
                principal: self.principal,
                request: self.request,
                response: self.response,
                released: AtomicBool::new(false),
            }),
        }
    }
}

pub struct ScopeGuard {
    scope: RequestScope,
}

impl ScopeGuard {
    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.release();
    }
}
