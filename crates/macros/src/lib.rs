//! Attribute macros turning impl blocks into graphstack declaration records.
//!
//! ```ignore
//! #[graphstack::controller]
//! impl ItemsController {
//!     #[query]
//!     async fn items(&self, #[inject] repo: Arc<ItemRepo>) -> anyhow::Result<Vec<Item>> { .. }
//!
//!     #[mutation]
//!     #[authorized("admin")]
//!     async fn create_item(&self, name: String) -> anyhow::Result<Item> { .. }
//! }
//!
//! #[graphstack::resolver(name = "Item", fields(id = "ID!", name = "String!"))]
//! impl ItemResolver {
//!     #[resolve]
//!     async fn label(&self, #[parent] item: Item) -> anyhow::Result<String> { .. }
//! }
//! ```
//!
//! Method names become camelCase field names and GraphQL types are inferred
//! from the Rust signature unless `returns` / `args(...)` are given.

mod declarations;

use proc_macro::TokenStream;
use syn::{parse_macro_input, ItemImpl};

use declarations::ClassKind;

#[proc_macro_attribute]
pub fn controller(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(ClassKind::Controller, attr, item)
}

#[proc_macro_attribute]
pub fn resolver(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(ClassKind::Resolver, attr, item)
}

fn expand(kind: ClassKind, attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemImpl);
    match declarations::expand(kind, attr.into(), item) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}
