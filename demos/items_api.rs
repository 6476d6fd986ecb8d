//! A small catalog served over HTTP.
//!
//! ```sh
//! cargo run --example items_api -- [config.toml]
//! curl -s localhost:4000/graphql -H 'content-type: application/json' \
//!     -H 'x-principal-id: ada' -H 'x-principal-roles: admin' \
//!     -d '{"query":"mutation { createItem(name: \"Lamp\", ownerId: 1) { id label owner } }"}'
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::Stream;
use graphstack::{
    bootstrap, BatchLoader, BoxFuture, FrameworkConfig, FrameworkOptions, GraphModule,
    HeaderPrincipalResolver, Invocation, Providers, Rule, Rules, SchemaBuilderOptions,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Item {
    id: String,
    name: String,
    owner_id: u64,
    status: String,
}

#[derive(Default)]
struct Catalog {
    items: Mutex<Vec<Item>>,
}

type OwnerLoader = BatchLoader<u64, String, fn(Vec<u64>) -> BoxFuture<'static, HashMap<u64, String>>>;

fn load_owners(ids: Vec<u64>) -> BoxFuture<'static, HashMap<u64, String>> {
    Box::pin(async move {
        tracing::info!(?ids, "loading owners");
        ids.into_iter()
            .map(|id| (id, format!("owner-{id}")))
            .collect()
    })
}

#[derive(Default)]
struct CatalogController;

#[graphstack::controller]
impl CatalogController {
    #[query(returns = "[Item!]!")]
    async fn items(&self, #[inject] catalog: Arc<Catalog>) -> anyhow::Result<Vec<Item>> {
        Ok(catalog.items.lock().map_err(|_| anyhow::anyhow!("catalog poisoned"))?.clone())
    }

    /// Adds an item in the DRAFT state.
    #[mutation]
    #[authorized("admin")]
    #[args_validator(Rules::new().field("name", Rule::MinLength(2)).field("name", Rule::MaxLength(40)))]
    async fn create_item(
        &self,
        name: String,
        owner_id: i32,
        #[inject] catalog: Arc<Catalog>,
    ) -> anyhow::Result<Item> {
        let mut items = catalog.items.lock().map_err(|_| anyhow::anyhow!("catalog poisoned"))?;
        let item = Item {
            id: (items.len() + 1).to_string(),
            name,
            owner_id: owner_id as u64,
            status: "DRAFT".to_string(),
        };
        items.push(item.clone());
        Ok(item)
    }

    #[subscription(returns = "String!")]
    fn heartbeat(&self, every_ms: Option<i32>) -> anyhow::Result<impl Stream<Item = anyhow::Result<String>> + Send + 'static> {
        let every = Duration::from_millis(every_ms.unwrap_or(1000).max(10) as u64);
        Ok(async_stream::stream! {
            let mut beat = 0u64;
            loop {
                tokio::time::sleep(every).await;
                beat += 1;
                yield Ok(format!("beat {beat}"));
            }
        })
    }
}

#[derive(Default)]
struct ItemResolver;

#[graphstack::resolver(fields(id = "ID!", name = "String!", status = "ItemStatus!"))]
impl ItemResolver {
    #[resolve]
    async fn label(&self, #[parent] item: Item) -> anyhow::Result<String> {
        Ok(format!("{} ({})", item.name, item.status.to_lowercase()))
    }

    #[resolve]
    async fn owner(&self, #[parent] item: Item, call: &Invocation) -> anyhow::Result<Option<String>> {
        let loader = call.loaders().get_or_insert_with("owners", || {
            OwnerLoader::new(Duration::from_millis(5), load_owners as fn(Vec<u64>) -> BoxFuture<'static, HashMap<u64, String>>)
        });
        Ok(loader.load(item.owner_id).await)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,graphstack=debug".into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => FrameworkConfig::from_file(path)?,
        None => FrameworkConfig::default(),
    };

    let mut providers = Providers::new();
    providers.singleton(Catalog::default());

    let catalog = GraphModule::new("catalog")
        .type_defs("enum ItemStatus { DRAFT PUBLISHED }")
        .declare::<CatalogController>()
        .declare::<ItemResolver>()
        .providers(providers);

    let options = FrameworkOptions::new()
        .config(config)
        .registry(graphstack::Registry::new())
        .schema(SchemaBuilderOptions::new().module(catalog))
        .principal_resolver(Arc::new(HeaderPrincipalResolver::default()));

    let framework = bootstrap(options).await?;
    println!("{}", framework.schema().sdl());

    tokio::signal::ctrl_c().await?;
    framework.stop().await?;
    Ok(())
}
