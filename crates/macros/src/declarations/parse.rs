use proc_macro2::{Ident, TokenStream};
use syn::{
    ext::IdentExt, parse::Parser, punctuated::Punctuated, Attribute, Expr, FnArg, ImplItem,
    ImplItemFn, ItemImpl, Lit, LitStr, Meta, Pat, Path, ReturnType, Token, Type,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Controller,
    Resolver,
}

impl ClassKind {
    pub fn constructor(self) -> &'static str {
        match self {
            ClassKind::Controller => "controller",
            ClassKind::Resolver => "resolver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Query,
    Mutation,
    Subscription,
    Resolve,
}

impl MethodKind {
    fn from_attr(attr: &Attribute) -> Option<Self> {
        let path = attr.path();
        if path.is_ident("query") {
            Some(MethodKind::Query)
        } else if path.is_ident("mutation") {
            Some(MethodKind::Mutation)
        } else if path.is_ident("subscription") {
            Some(MethodKind::Subscription)
        } else if path.is_ident("resolve") {
            Some(MethodKind::Resolve)
        } else {
            None
        }
    }

    pub fn constructor(self) -> &'static str {
        match self {
            MethodKind::Query => "query",
            MethodKind::Mutation => "mutation",
            MethodKind::Subscription => "subscription",
            MethodKind::Resolve => "resolve",
        }
    }
}

#[derive(Debug, Default)]
pub struct ClassArgs {
    pub name: Option<LitStr>,
    pub factory: Option<Path>,
    pub fields: Vec<(String, LitStr)>,
}

#[derive(Debug)]
pub struct ParsedClass {
    pub kind: ClassKind,
    pub args: ClassArgs,
    pub roles: Option<Vec<LitStr>>,
    pub methods: Vec<ParsedMethod>,
}

#[derive(Debug)]
pub enum Param {
    Invocation,
    Parent { ident: Ident, ty: Type },
    Inject { ident: Ident, ty: Type },
    Argument { ident: Ident, ty: Type, graphql_name: String },
}

#[derive(Debug, Default)]
struct FieldAttr {
    name: Option<LitStr>,
    returns: Option<LitStr>,
    description: Option<LitStr>,
    args: Vec<(String, LitStr)>,
}

#[derive(Debug)]
pub struct ParsedMethod {
    pub ident: Ident,
    pub kind: MethodKind,
    pub graphql_name: String,
    pub returns: Option<LitStr>,
    pub description: Option<String>,
    pub explicit_args: Vec<(String, LitStr)>,
    pub roles: Option<Vec<LitStr>>,
    pub validator: Option<Expr>,
    pub params: Vec<Param>,
    /// The `T` of `Result<T, E>`.
    pub output: Type,
    pub is_async: bool,
}

impl ParsedMethod {
    pub fn rust_name(&self) -> String {
        self.ident.unraw().to_string()
    }
}

pub fn parse_class_args(attr: TokenStream) -> syn::Result<ClassArgs> {
    let mut args = ClassArgs::default();
    if attr.is_empty() {
        return Ok(args);
    }

    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            args.name = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("factory") {
            args.factory = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("fields") {
            meta.parse_nested_meta(|field| {
                let ident = field
                    .path
                    .get_ident()
                    .ok_or_else(|| field.error("expected a field name"))?;
                args.fields
                    .push((ident.unraw().to_string(), field.value()?.parse()?));
                Ok(())
            })?;
        } else {
            return Err(meta.error("unsupported argument; expected `name`, `factory` or `fields`"));
        }
        Ok(())
    });

    parser.parse2(attr)?;
    Ok(args)
}

/// Collects the declarations of an impl block and strips the helper
/// attributes from it so the block compiles as plain Rust.
pub fn parse_class(kind: ClassKind, args: ClassArgs, item: &mut ItemImpl) -> syn::Result<ParsedClass> {
    if item.trait_.is_some() {
        return Err(syn::Error::new_spanned(
            &item.self_ty,
            "expected an inherent impl block",
        ));
    }
    if !item.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &item.generics,
            "generic impl blocks cannot be declared",
        ));
    }
    if args.name.is_some() && kind == ClassKind::Controller {
        return Err(syn::Error::new_spanned(
            args.name.as_ref(),
            "`name` only applies to #[resolver]",
        ));
    }
    if !args.fields.is_empty() && kind == ClassKind::Controller {
        return Err(syn::Error::new_spanned(
            &item.self_ty,
            "`fields` only applies to #[resolver]",
        ));
    }

    let roles = take_roles(&mut item.attrs)?;

    let mut methods = Vec::new();
    for impl_item in &mut item.items {
        if let ImplItem::Fn(method) = impl_item {
            if let Some(parsed) = parse_method(kind, method)? {
                methods.push(parsed);
            }
        }
    }

    Ok(ParsedClass {
        kind,
        args,
        roles,
        methods,
    })
}

fn take_roles(attrs: &mut Vec<Attribute>) -> syn::Result<Option<Vec<LitStr>>> {
    let mut roles = None;
    let mut error = None;
    attrs.retain(|attr| {
        if !attr.path().is_ident("authorized") {
            return true;
        }
        match parse_roles(attr) {
            Ok(parsed) => roles = Some(parsed),
            Err(err) => error = Some(err),
        }
        false
    });
    match error {
        Some(err) => Err(err),
        None => Ok(roles),
    }
}

fn parse_roles(attr: &Attribute) -> syn::Result<Vec<LitStr>> {
    match &attr.meta {
        Meta::Path(_) => Ok(Vec::new()),
        _ => {
            let roles = attr.parse_args_with(Punctuated::<LitStr, Token![,]>::parse_terminated)?;
            Ok(roles.into_iter().collect())
        }
    }
}

fn parse_method(class: ClassKind, method: &mut ImplItemFn) -> syn::Result<Option<ParsedMethod>> {
    let mut kind = None;
    let mut field = FieldAttr::default();
    let mut validator = None;

    let mut kept = Vec::with_capacity(method.attrs.len());
    for attr in method.attrs.drain(..) {
        if let Some(found) = MethodKind::from_attr(&attr) {
            if kind.is_some() {
                return Err(syn::Error::new_spanned(
                    &attr,
                    "a method can carry only one of #[query], #[mutation], #[subscription] or #[resolve]",
                ));
            }
            kind = Some(found);
            parse_field_attr(&attr, &mut field)?;
        } else if attr.path().is_ident("args_validator") {
            validator = Some(attr.parse_args::<Expr>()?);
        } else {
            kept.push(attr);
        }
    }
    method.attrs = kept;

    let roles = take_roles(&mut method.attrs)?;

    let Some(kind) = kind else {
        if let Some(validator) = validator {
            return Err(syn::Error::new_spanned(
                validator,
                "#[args_validator] needs #[query], #[mutation], #[subscription] or #[resolve]",
            ));
        }
        if roles.is_some() {
            return Err(syn::Error::new_spanned(
                &method.sig.ident,
                "#[authorized] needs #[query], #[mutation], #[subscription] or #[resolve]",
            ));
        }
        return Ok(None);
    };

    if kind == MethodKind::Resolve && class == ClassKind::Controller {
        return Err(syn::Error::new_spanned(
            &method.sig.ident,
            "#[resolve] is only allowed inside #[resolver]",
        ));
    }

    match method.sig.inputs.first() {
        Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                &method.sig,
                "declared methods must take `&self`",
            ))
        }
    }

    let params = parse_params(method)?;
    let output = result_ok_type(&method.sig.output).ok_or_else(|| {
        syn::Error::new_spanned(&method.sig, "declared methods must return a `Result`")
    })?;

    let graphql_name = match &field.name {
        Some(name) => name.value(),
        None => camel_case(&method.sig.ident.unraw().to_string()),
    };
    let description = field
        .description
        .map(|lit| lit.value())
        .or_else(|| doc_comment(&method.attrs));

    Ok(Some(ParsedMethod {
        ident: method.sig.ident.clone(),
        kind,
        graphql_name,
        returns: field.returns,
        description,
        explicit_args: field.args,
        roles,
        validator,
        params,
        output,
        is_async: method.sig.asyncness.is_some(),
    }))
}

fn parse_field_attr(attr: &Attribute, field: &mut FieldAttr) -> syn::Result<()> {
    if let Meta::Path(_) = attr.meta {
        return Ok(());
    }

    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("name") {
            field.name = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("returns") {
            field.returns = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("description") {
            field.description = Some(meta.value()?.parse()?);
            Ok(())
        } else if meta.path.is_ident("args") {
            meta.parse_nested_meta(|arg| {
                let ident = arg
                    .path
                    .get_ident()
                    .ok_or_else(|| arg.error("expected an argument name"))?;
                field.args.push((ident.unraw().to_string(), arg.value()?.parse()?));
                Ok(())
            })
        } else {
            Err(meta.error(
                "unsupported argument; expected `name`, `returns`, `description` or `args`",
            ))
        }
    })
}

fn parse_params(method: &mut ImplItemFn) -> syn::Result<Vec<Param>> {
    let mut params = Vec::new();

    for input in method.sig.inputs.iter_mut() {
        let FnArg::Typed(pat_type) = input else {
            continue;
        };

        let mut parent = false;
        let mut inject = false;
        pat_type.attrs.retain(|attr| {
            if attr.path().is_ident("parent") {
                parent = true;
                false
            } else if attr.path().is_ident("inject") {
                inject = true;
                false
            } else {
                true
            }
        });

        if is_invocation(&pat_type.ty) {
            params.push(Param::Invocation);
            continue;
        }

        let ident = match &*pat_type.pat {
            Pat::Ident(pat_ident) => pat_ident.ident.clone(),
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "declared method parameters must be plain identifiers",
                ))
            }
        };
        let ty = (*pat_type.ty).clone();

        params.push(match (parent, inject) {
            (true, true) => {
                return Err(syn::Error::new_spanned(
                    &ident,
                    "a parameter cannot be both #[parent] and #[inject]",
                ))
            }
            (true, false) => Param::Parent { ident, ty },
            (false, true) => Param::Inject { ident, ty },
            (false, false) => {
                let graphql_name = camel_case(&ident.unraw().to_string());
                Param::Argument {
                    ident,
                    ty,
                    graphql_name,
                }
            }
        });
    }

    Ok(params)
}

fn is_invocation(ty: &Type) -> bool {
    match ty {
        Type::Reference(reference) => match &*reference.elem {
            Type::Path(path) => path
                .path
                .segments
                .last()
                .map(|segment| segment.ident == "Invocation")
                .unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}

fn result_ok_type(output: &ReturnType) -> Option<Type> {
    let ReturnType::Type(_, ty) = output else {
        return None;
    };
    let Type::Path(path) = &**ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    first_type_arg(segment).cloned()
}

pub fn first_type_arg(segment: &syn::PathSegment) -> Option<&Type> {
    let syn::PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    args.args.iter().find_map(|arg| match arg {
        syn::GenericArgument::Type(ty) => Some(ty),
        _ => None,
    })
}

fn doc_comment(attrs: &[Attribute]) -> Option<String> {
    let lines: Vec<String> = attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(nv) => match &nv.value {
                Expr::Lit(expr) => match &expr.lit {
                    Lit::Str(s) => Some(s.value().trim().to_string()),
                    _ => None,
                },
                _ => None,
            },
            _ => None,
        })
        .collect();

    let text = lines.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for ch in name.trim_start_matches('_').chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}
