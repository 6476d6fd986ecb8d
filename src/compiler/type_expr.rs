use std::fmt;

use async_graphql::dynamic::TypeRef;

/// A parsed GraphQL type expression such as `[Item!]!`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    Named(String),
    List(Box<TypeExpr>),
    NonNull(Box<TypeExpr>),
}

impl TypeExpr {
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (inner, non_null) = match input.strip_suffix('!') {
            Some(rest) => (rest.trim_end(), true),
            None => (input, false),
        };

        let ty = if let Some(list) = inner.strip_prefix('[') {
            let item = list.strip_suffix(']')?;
            TypeExpr::List(Box::new(TypeExpr::parse(item)?))
        } else if is_name(inner) {
            TypeExpr::Named(inner.to_string())
        } else {
            return None;
        };

        Some(if non_null {
            TypeExpr::NonNull(Box::new(ty))
        } else {
            ty
        })
    }

    /// The innermost named type.
    pub fn base_name(&self) -> &str {
        match self {
            TypeExpr::Named(name) => name,
            TypeExpr::List(inner) | TypeExpr::NonNull(inner) => inner.base_name(),
        }
    }

    pub fn to_type_ref(&self) -> TypeRef {
        match self {
            TypeExpr::Named(name) => TypeRef::Named(name.clone().into()),
            TypeExpr::List(inner) => TypeRef::List(Box::new(inner.to_type_ref())),
            TypeExpr::NonNull(inner) => TypeRef::NonNull(Box::new(inner.to_type_ref())),
        }
    }
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Named(name) => f.write_str(name),
            TypeExpr::List(inner) => write!(f, "[{inner}]"),
            TypeExpr::NonNull(inner) => write!(f, "{inner}!"),
        }
    }
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
