use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_graphql::{dynamic, Request, Response};
use futures_util::stream::{BoxStream, StreamExt};
use indexmap::IndexMap;

use crate::container::Providers;
use crate::scope::{RequestScope, ScopeBuilder};
use crate::wrapper::CompiledField;

struct SchemaInner {
    schema: dynamic::Schema,
    providers: Arc<Providers>,
    fields: IndexMap<(String, String), Arc<CompiledField>>,
}

/// The executable result of compiling a registry. Cheap to clone.
#[derive(Clone)]
pub struct CompiledSchema {
    inner: Arc<SchemaInner>,
}

impl CompiledSchema {
    pub(crate) fn new(
        schema: dynamic::Schema,
        providers: Arc<Providers>,
        fields: IndexMap<(String, String), Arc<CompiledField>>,
    ) -> Self {
        Self {
            inner: Arc::new(SchemaInner {
                schema,
                providers,
                fields,
            }),
        }
    }

    pub fn providers(&self) -> &Arc<Providers> {
        &self.inner.providers
    }

    /// Starts a request scope over this schema's providers.
    pub fn scope(&self) -> ScopeBuilder {
        RequestScope::builder(self.inner.providers.clone())
    }

    /// Executes `request` inside an existing scope. The caller owns the scope
    /// and is responsible for releasing it.
    pub async fn execute_in(&self, request: impl Into<Request>, scope: &RequestScope) -> Response {
        let request = request.into().data(scope.clone());
        self.inner.schema.execute(request).await
    }

    /// Executes `request` in a fresh scope that is released afterwards.
    pub async fn execute(&self, request: impl Into<Request>) -> Response {
        let scope = self.scope().build();
        let _guard = scope.guard();
        self.execute_in(request, &scope).await
    }

    pub async fn execute_query(&self, query: &str) -> Response {
        self.execute(Request::new(query)).await
    }

    /// Executes a subscription (or any operation) as a stream. `scope` is
    /// released when the stream is dropped.
    pub fn execute_stream(
        &self,
        request: impl Into<Request>,
        scope: RequestScope,
    ) -> BoxStream<'static, Response> {
        let guard = scope.guard();
        let request = request.into().data(scope);
        self.inner
            .schema
            .execute_stream(request)
            .map(move |response| {
                let _ = &guard;
                response
            })
            .boxed()
    }

    pub fn sdl(&self) -> String {
        self.inner.schema.sdl()
    }

    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&CompiledField> {
        self.inner
            .fields
            .get(&(type_name.to_string(), field_name.to_string()))
            .map(Arc::as_ref)
    }

    pub fn fields(&self) -> impl Iterator<Item = &CompiledField> + '_ {
        self.inner.fields.values().map(Arc::as_ref)
    }

    pub fn dynamic(&self) -> &dynamic::Schema {
        &self.inner.schema
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("fields", &self.inner.fields.len())
            .field("providers", &self.inner.providers)
            .finish()
    }
}

/// Shared slot holding the schema currently being served; swapped as a whole
/// on rebuild so in-flight requests keep the schema they started with.
#[derive(Clone)]
pub struct SchemaHandle {
    current: Arc<ArcSwap<CompiledSchema>>,
}

impl SchemaHandle {
    pub fn new(schema: CompiledSchema) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(schema)),
        }
    }

    pub fn load(&self) -> Arc<CompiledSchema> {
        self.current.load_full()
    }

    /// Installs `schema` and returns the one it replaced.
    pub fn swap(&self, schema: CompiledSchema) -> Arc<CompiledSchema> {
        self.current.swap(Arc::new(schema))
    }
}

impl fmt::Debug for SchemaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SchemaHandle").field(&*self.load()).finish()
    }
}

impl From<CompiledSchema> for SchemaHandle {
    fn from(schema: CompiledSchema) -> Self {
        Self::new(schema)
    }
}
