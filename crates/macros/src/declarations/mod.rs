mod codegen;
mod parse;

use proc_macro2::TokenStream;
use syn::ItemImpl;

pub use parse::ClassKind;

pub fn expand(kind: ClassKind, attr: TokenStream, mut item: ItemImpl) -> syn::Result<TokenStream> {
    let args = parse::parse_class_args(attr)?;
    let class = parse::parse_class(kind, args, &mut item)?;
    codegen::generate(&class, &item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quote::quote;
    use syn::parse_quote;

    fn expand_controller(item: ItemImpl) -> syn::Result<String> {
        expand(ClassKind::Controller, TokenStream::new(), item).map(|tokens| tokens.to_string())
    }

    #[test]
    fn test_helper_attributes_are_stripped() {
        let item: ItemImpl = parse_quote! {
            impl Items {
                #[query]
                async fn item_count(&self) -> anyhow::Result<i32> { Ok(0) }

                #[mutation(args(name = "String!"))]
                #[authorized("admin")]
                #[args_validator(Rules::new())]
                async fn create_item(&self, name: String) -> anyhow::Result<Item> { todo!() }
            }
        };
        let expanded = expand_controller(item).unwrap();
        assert!(!expanded.contains("# [query]"));
        assert!(!expanded.contains("# [authorized"));
        assert!(expanded.contains("\"itemCount\""));
        assert!(expanded.contains("\"createItem\""));
        assert!(expanded.contains("\"Int!\""));
        assert!(expanded.contains("\"Item!\""));
        assert!(expanded.contains("args_validator"));
    }

    #[test]
    fn test_resolve_rejected_in_controller() {
        let item: ItemImpl = parse_quote! {
            impl Items {
                #[resolve]
                async fn label(&self) -> anyhow::Result<String> { todo!() }
            }
        };
        let err = expand_controller(item).unwrap_err();
        assert!(err.to_string().contains("#[resolver]"));
    }

    #[test]
    fn test_uninferrable_return_needs_annotation() {
        let item: ItemImpl = parse_quote! {
            impl Items {
                #[query]
                async fn lookup(&self) -> anyhow::Result<HashMap<String, i32>> { todo!() }
            }
        };
        assert!(expand_controller(item).is_err());
    }

    #[test]
    fn test_resolver_arguments() {
        let item: ItemImpl = parse_quote! {
            impl ItemResolver {
                #[resolve(returns = "String!")]
                async fn label(&self, #[parent] item: Item, upper: Option<bool>) -> anyhow::Result<String> { todo!() }
            }
        };
        let attr = quote! { name = "Item", fields(id = "ID!", name = "String!") };
        let expanded = expand(ClassKind::Resolver, attr, item).unwrap().to_string();
        assert!(expanded.contains("graph_type"));
        assert!(expanded.contains("\"upper\" , \"Boolean\""));
        assert!(!expanded.contains("# [parent]"));
    }

    #[test]
    fn test_camel_case() {
        assert_eq!(parse::camel_case("create_item"), "createItem");
        assert_eq!(parse::camel_case("_private_thing"), "privateThing");
        assert_eq!(parse::camel_case("ping"), "ping");
    }
}
