//! Framework bootstrap: compiles the schema, mounts the router and runs the
//! HTTP server.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::PrincipalResolver;
use crate::compiler::{SchemaBuilder, SchemaBuilderOptions};
use crate::config::FrameworkConfig;
use crate::container::Providers;
use crate::error::{Error, Result};
use crate::registry::{global_snapshot, Registry};
use crate::schema::{CompiledSchema, SchemaHandle};
use crate::server::{self, HttpOptions};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
pub struct FrameworkOptions {
    pub config: FrameworkConfig,
    pub schema: SchemaBuilderOptions,
    /// Registry to compile. The global registry is snapshotted when absent.
    pub registry: Option<Registry>,
    pub principal_resolver: Option<Arc<dyn PrincipalResolver>>,
    /// Values merged into every request scope.
    pub context: Providers,
}

impl FrameworkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: FrameworkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(mut self, schema: SchemaBuilderOptions) -> Self {
        self.schema = schema;
        self
    }

    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn principal_resolver(mut self, resolver: Arc<dyn PrincipalResolver>) -> Self {
        self.principal_resolver = Some(resolver);
        self
    }

    pub fn context(mut self, context: Providers) -> Self {
        self.context = context;
        self
    }

    fn compile(&self) -> Result<CompiledSchema> {
        let registry = match &self.registry {
            Some(registry) => registry.clone(),
            None => global_snapshot(),
        };
        let options = self.schema.clone().with_config(&self.config.schema);
        Ok(SchemaBuilder::new(options).build(&registry)?)
    }

    fn http_options(&self) -> HttpOptions {
        let mut options = HttpOptions::from_config(&self.config.http);
        if let Some(resolver) = &self.principal_resolver {
            options = options.principal_resolver(resolver.clone());
        }
        if !self.context.is_empty() {
            options = options.context(self.context.clone());
        }
        options
    }
}

impl fmt::Debug for FrameworkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameworkOptions")
            .field("config", &self.config)
            .field("schema", &self.schema)
            .field("registry", &self.registry.as_ref().map(Registry::len))
            .field("principal_resolver", &self.principal_resolver.is_some())
            .field("context", &self.context)
            .finish()
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// A compiled schema served over HTTP.
///
/// The schema is compiled once in [`Framework::new`]; [`Framework::reload`]
/// recompiles and swaps it without restarting the listener.
pub struct Framework {
    options: FrameworkOptions,
    schema: SchemaHandle,
    running: Mutex<Option<Running>>,
}

impl Framework {
    pub fn new(options: FrameworkOptions) -> Result<Self> {
        options.config.validate()?;
        let schema = options.compile()?;
        Ok(Self {
            options,
            schema: SchemaHandle::new(schema),
            running: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.options.config
    }

    /// The schema currently being served.
    pub fn schema(&self) -> Arc<CompiledSchema> {
        self.schema.load()
    }

    pub fn handle(&self) -> SchemaHandle {
        self.schema.clone()
    }

    pub fn router(&self) -> Router {
        server::router(
            self.schema.clone(),
            &self.options.config,
            self.options.http_options(),
        )
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.addr)
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Binds the configured address and serves in a background task.
    /// Returns the bound address, which differs from the configured one
    /// when port `0` is used.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.is_running() {
            return Err(Error::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.options.config.socket_addr()?).await?;
        let addr = listener.local_addr()?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = self.router();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                    tracing::info!(%addr, "shutting down GraphQL server");
                })
                .await
        });

        tracing::info!(
            %addr,
            path = %self.options.config.path,
            playground = self.options.config.playground,
            "GraphQL server listening"
        );
        *running = Some(Running {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stops the server. Connections still open after a short grace period
    /// are dropped. Stopping a framework that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running {
            addr,
            shutdown,
            mut task,
        }) = running
        else {
            tracing::debug!("stop called on a framework that is not running");
            return Ok(());
        };

        let _ = shutdown.send(());
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(served)) => served?,
            Ok(Err(err)) => return Err(Error::Io(std::io::Error::other(err))),
            Err(_) => {
                tracing::warn!(%addr, "GraphQL server did not drain in time; aborting");
                task.abort();
            }
        }
        tracing::info!(%addr, "GraphQL server stopped");
        Ok(())
    }

    /// Recompiles the schema and swaps it in. Requests already executing keep
    /// the schema they started with. On failure the current schema stays.
    pub async fn reload(&self) -> Result<()> {
        let schema = self.options.compile()?;
        self.schema.swap(schema);
        tracing::info!("GraphQL schema reloaded");
        Ok(())
    }
}

impl fmt::Debug for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framework")
            .field("options", &self.options)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Constructs a framework and starts serving.
pub async fn bootstrap(options: FrameworkOptions) -> Result<Framework> {
    let framework = Framework::new(options)?;
    framework.start().await?;
    Ok(framework)
}

/// Compiles the global registry without starting a server.
pub fn build_schema(options: SchemaBuilderOptions) -> Result<CompiledSchema> {
    Ok(SchemaBuilder::new(options).build(&global_snapshot())?)
}
