use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{ItemImpl, LitStr, Type};

use super::parse::{first_type_arg, MethodKind, Param, ParsedClass, ParsedMethod};

pub fn generate(class: &ParsedClass, item: &ItemImpl) -> syn::Result<TokenStream> {
    let self_ty = &item.self_ty;
    let class_record = generate_class_record(class);

    let class_roles = class.roles.as_ref().map(|roles| {
        let roles = role_list(roles);
        quote! {
            __records.push(::graphstack::DeclarationRecord::authorized::<Self, _>(
                ::std::option::Option::None,
                #roles,
            ));
        }
    });

    let methods: Vec<TokenStream> = class
        .methods
        .iter()
        .map(generate_method_records)
        .collect::<syn::Result<_>>()?;

    Ok(quote! {
        #item

        impl ::graphstack::Declarations for #self_ty {
            fn declarations() -> ::std::vec::Vec<::graphstack::DeclarationRecord> {
                let mut __records = ::std::vec::Vec::new();
                __records.push(#class_record);
                #class_roles
                #(#methods)*
                __records
            }
        }
    })
}

fn generate_class_record(class: &ParsedClass) -> TokenStream {
    let constructor = format_ident!("{}", class.kind.constructor());
    let factory = match &class.args.factory {
        Some(path) => quote! { ::graphstack::Factory::new::<Self, _>(#path) },
        None => quote! { ::graphstack::Factory::from_default::<Self>() },
    };
    let graph_type = class
        .args
        .name
        .as_ref()
        .map(|name| quote! { .graph_type(#name) });
    let data_fields = class
        .args
        .fields
        .iter()
        .map(|(name, ty)| quote! { .data_field(#name, #ty) });

    quote! {
        ::graphstack::DeclarationRecord::#constructor::<Self>(#factory)
            #graph_type
            #(#data_fields)*
    }
}

fn generate_method_records(method: &ParsedMethod) -> syn::Result<TokenStream> {
    let constructor = format_ident!("{}", method.kind.constructor());
    let rust_name = method.rust_name();
    let graphql_name = &method.graphql_name;

    let returns = match &method.returns {
        Some(returns) => returns.value(),
        None => infer_returns(method)?,
    };

    let arguments = generate_arguments(method)?;
    let description = method
        .description
        .as_ref()
        .map(|text| quote! { .description(#text) });
    let handler = generate_handler(method);

    let roles = method.roles.as_ref().map(|roles| {
        let roles = role_list(roles);
        quote! {
            __records.push(::graphstack::DeclarationRecord::authorized::<Self, _>(
                ::std::option::Option::Some(#rust_name),
                #roles,
            ));
        }
    });

    let validator = method.validator.as_ref().map(|validator| {
        quote! {
            __records.push(::graphstack::DeclarationRecord::args_validator::<Self, _>(
                #rust_name,
                #validator,
            ));
        }
    });

    Ok(quote! {
        __records.push(
            ::graphstack::DeclarationRecord::#constructor::<Self>(#rust_name)
                .name(#graphql_name)
                .returns(#returns)
                #(#arguments)*
                #description
                .handler(#handler)
        );
        #roles
        #validator
    })
}

fn infer_returns(method: &ParsedMethod) -> syn::Result<String> {
    let inferred = match method.kind {
        MethodKind::Subscription => stream_item(&method.output).and_then(graphql_type),
        _ => graphql_type(&method.output),
    };
    inferred.ok_or_else(|| {
        syn::Error::new_spanned(
            &method.output,
            match method.kind {
                MethodKind::Subscription => {
                    "subscriptions must return a stream of `Result` items; add `returns = \"...\"` if the item type is not inferable"
                }
                _ => "cannot infer the GraphQL type of this result; add `returns = \"...\"`",
            },
        )
    })
}

fn generate_arguments(method: &ParsedMethod) -> syn::Result<Vec<TokenStream>> {
    let mut used = vec![false; method.explicit_args.len()];
    let mut arguments = Vec::new();

    for param in &method.params {
        let Param::Argument {
            ident,
            ty,
            graphql_name,
        } = param
        else {
            continue;
        };

        let rust_name = ident.to_string();
        let explicit = method
            .explicit_args
            .iter()
            .position(|(name, _)| name == graphql_name || *name == rust_name);

        let type_expr = match explicit {
            Some(index) => {
                used[index] = true;
                method.explicit_args[index].1.value()
            }
            None => graphql_type(ty).ok_or_else(|| {
                syn::Error::new_spanned(
                    ty,
                    format!(
                        "cannot infer the GraphQL type of argument `{rust_name}`; add `args({rust_name} = \"...\")`"
                    ),
                )
            })?,
        };
        arguments.push(quote! { .argument(#graphql_name, #type_expr) });
    }

    // Arguments only read through `&Invocation`.
    for ((name, ty), used) in method.explicit_args.iter().zip(used) {
        if !used {
            arguments.push(quote! { .argument(#name, #ty) });
        }
    }

    Ok(arguments)
}

fn generate_handler(method: &ParsedMethod) -> TokenStream {
    let ident = &method.ident;

    let extractions = method.params.iter().filter_map(|param| match param {
        Param::Invocation => None,
        Param::Parent { ident, ty } => Some(quote! {
            let #ident: #ty = __call.parent()?;
        }),
        Param::Inject { ident, ty } => Some(quote! {
            let #ident: #ty = __call.inject()?;
        }),
        Param::Argument {
            ident,
            ty,
            graphql_name,
        } => Some(quote! {
            let #ident: #ty = __call.arg(#graphql_name)?;
        }),
    });

    let call_args = method.params.iter().map(|param| match param {
        Param::Invocation => quote! { &__call },
        Param::Parent { ident, .. } | Param::Inject { ident, .. } | Param::Argument { ident, .. } => {
            quote! { #ident }
        }
    });

    let call = if method.is_async {
        quote! { __this.#ident(#(#call_args),*).await }
    } else {
        quote! { __this.#ident(#(#call_args),*) }
    };

    let wrap = match method.kind {
        MethodKind::Subscription => quote! { ::graphstack::Handler::stream },
        _ => quote! { ::graphstack::Handler::field },
    };

    quote! {
        #wrap(|__this: ::std::sync::Arc<Self>, __call: ::graphstack::Invocation| async move {
            #(#extractions)*
            let __result = #call;
            ::std::result::Result::<_, ::graphstack::__private::anyhow::Error>::Ok(
                __result.map_err(::std::convert::Into::<::graphstack::__private::anyhow::Error>::into)?,
            )
        })
    }
}

/// GraphQL type expression of a Rust type: `Vec<Option<String>>` is
/// `[String]!`, `Option<Item>` is `Item`.
pub fn graphql_type(ty: &Type) -> Option<String> {
    match ty {
        Type::Reference(reference) => graphql_type(&reference.elem),
        Type::Paren(paren) => graphql_type(&paren.elem),
        Type::Group(group) => graphql_type(&group.elem),
        Type::Path(path) if path.qself.is_none() => {
            let segment = path.path.segments.last()?;
            let name = segment.ident.to_string();
            match name.as_str() {
                "Option" => {
                    let inner = graphql_type(first_type_arg(segment)?)?;
                    Some(inner.strip_suffix('!').map(str::to_string).unwrap_or(inner))
                }
                "Vec" | "VecDeque" | "HashSet" | "BTreeSet" => {
                    Some(format!("[{}]!", graphql_type(first_type_arg(segment)?)?))
                }
                "Box" | "Arc" | "Rc" => graphql_type(first_type_arg(segment)?),
                _ => match scalar_name(&name) {
                    Some(scalar) => Some(format!("{scalar}!")),
                    None if segment.arguments.is_empty() => Some(format!("{name}!")),
                    None => None,
                },
            }
        }
        _ => None,
    }
}

fn scalar_name(name: &str) -> Option<&'static str> {
    match name {
        "String" | "str" | "char" => Some("String"),
        "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize" => {
            Some("Int")
        }
        "f32" | "f64" => Some("Float"),
        "bool" => Some("Boolean"),
        _ => None,
    }
}

/// Item type of a subscription result such as
/// `impl Stream<Item = Result<T, E>>` or `BoxStream<'static, Result<T, E>>`.
/// Streams of plain items are not accepted by `Handler::stream`.
pub fn stream_item(ty: &Type) -> Option<&Type> {
    let item = match ty {
        Type::ImplTrait(impl_trait) => stream_bound_item(impl_trait.bounds.iter()),
        Type::TraitObject(object) => stream_bound_item(object.bounds.iter()),
        Type::Path(path) => {
            let segment = path.path.segments.last()?;
            match segment.ident.to_string().as_str() {
                "Pin" | "Box" => return stream_item(first_type_arg(segment)?),
                "BoxStream" | "LocalBoxStream" => first_type_arg(segment),
                _ => None,
            }
        }
        _ => None,
    }?;

    let Type::Path(path) = item else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    first_type_arg(segment)
}

fn stream_bound_item<'a>(
    mut bounds: impl Iterator<Item = &'a syn::TypeParamBound>,
) -> Option<&'a Type> {
    bounds.find_map(|bound| {
        let syn::TypeParamBound::Trait(trait_bound) = bound else {
            return None;
        };
        let segment = trait_bound.path.segments.last()?;
        if segment.ident != "Stream" {
            return None;
        }
        let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
            return None;
        };
        args.args.iter().find_map(|arg| match arg {
            syn::GenericArgument::AssocType(assoc) if assoc.ident == "Item" => Some(&assoc.ty),
            _ => None,
        })
    })
}

/// An empty list lifts an inherited restriction, so it still yields a record.
fn role_list(roles: &[LitStr]) -> TokenStream {
    if roles.is_empty() {
        quote! { ::std::vec::Vec::<&str>::new() }
    } else {
        quote! { [#(#roles),*] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_graphql_type_mapping() {
        let cases: Vec<(Type, &str)> = vec![
            (parse_quote!(String), "String!"),
            (parse_quote!(&'static str), "String!"),
            (parse_quote!(i64), "Int!"),
            (parse_quote!(f64), "Float!"),
            (parse_quote!(bool), "Boolean!"),
            (parse_quote!(Option<String>), "String"),
            (parse_quote!(Vec<Item>), "[Item!]!"),
            (parse_quote!(Option<Vec<Option<i32>>>), "[Int]"),
            (parse_quote!(std::sync::Arc<Item>), "Item!"),
        ];
        for (ty, expected) in cases {
            assert_eq!(graphql_type(&ty).as_deref(), Some(expected));
        }

        let generic: Type = parse_quote!(HashMap<String, i32>);
        assert_eq!(graphql_type(&generic), None);
    }

    #[test]
    fn test_stream_item() {
        let ty: Type = parse_quote!(impl Stream<Item = Result<i32, anyhow::Error>> + Send);
        assert_eq!(stream_item(&ty).and_then(graphql_type).as_deref(), Some("Int!"));

        let ty: Type = parse_quote!(BoxStream<'static, anyhow::Result<Item>>);
        assert_eq!(stream_item(&ty).and_then(graphql_type).as_deref(), Some("Item!"));

        let ty: Type = parse_quote!(BoxStream<'static, Item>);
        assert!(stream_item(&ty).is_none());

        let ty: Type = parse_quote!(String);
        assert!(stream_item(&ty).is_none());
    }
}
