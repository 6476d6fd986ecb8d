//! Import of hand-written SDL type definitions.

use async_graphql_parser::types::{
    InputValueDefinition, TypeDefinition, TypeKind, TypeSystemDefinition,
};
use async_graphql_parser::Positioned;
use async_graphql_value::ConstValue;

use super::type_expr::TypeExpr;
use crate::error::SchemaError;

#[derive(Debug, Clone)]
pub(crate) struct ExplicitType {
    pub name: String,
    pub description: Option<String>,
    pub kind: ExplicitKind,
}

#[derive(Debug, Clone)]
pub(crate) enum ExplicitKind {
    Object(Vec<ExplicitField>),
    Input(Vec<ExplicitInput>),
    Enum(Vec<ExplicitEnumValue>),
    Scalar,
}

#[derive(Debug, Clone)]
pub(crate) struct ExplicitField {
    pub name: String,
    pub ty: TypeExpr,
    pub description: Option<String>,
    pub arguments: Vec<ExplicitInput>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExplicitInput {
    pub name: String,
    pub ty: TypeExpr,
    pub description: Option<String>,
    pub default_value: Option<ConstValue>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExplicitEnumValue {
    pub name: String,
    pub description: Option<String>,
}

pub(crate) fn parse_type_defs(sdl: &str) -> Result<Vec<ExplicitType>, SchemaError> {
    let document = async_graphql_parser::parse_schema(sdl).map_err(|err| SchemaError::Parse {
        message: err.to_string(),
    })?;

    document
        .definitions
        .into_iter()
        .map(|definition| match definition {
            TypeSystemDefinition::Type(ty) => convert_type(ty.node),
            TypeSystemDefinition::Schema(_) => Err(SchemaError::Unsupported {
                type_name: "schema".into(),
                message: "schema definitions are derived from declarations".into(),
            }),
            TypeSystemDefinition::Directive(directive) => Err(SchemaError::Unsupported {
                type_name: directive.node.name.node.to_string(),
                message: "custom directives are not supported".into(),
            }),
        })
        .collect()
}

fn convert_type(definition: TypeDefinition) -> Result<ExplicitType, SchemaError> {
    let name = definition.name.node.to_string();
    if definition.extend {
        return Err(SchemaError::Unsupported {
            type_name: name,
            message: "type extensions are not supported".into(),
        });
    }

    let kind = match definition.kind {
        TypeKind::Scalar => ExplicitKind::Scalar,
        TypeKind::Object(object) => {
            if !object.implements.is_empty() {
                return Err(SchemaError::Unsupported {
                    type_name: name,
                    message: "interfaces are not supported".into(),
                });
            }
            let fields = object
                .fields
                .into_iter()
                .map(|field| {
                    let field = field.node;
                    let field_name = field.name.node.to_string();
                    let path = format!("{name}.{field_name}");
                    Ok(ExplicitField {
                        ty: type_expr(&path, &field.ty.node.to_string())?,
                        description: text(field.description),
                        arguments: field
                            .arguments
                            .into_iter()
                            .map(|arg| convert_input(&path, arg))
                            .collect::<Result<_, _>>()?,
                        name: field_name,
                    })
                })
                .collect::<Result<_, SchemaError>>()?;
            ExplicitKind::Object(fields)
        }
        TypeKind::InputObject(input) => ExplicitKind::Input(
            input
                .fields
                .into_iter()
                .map(|field| convert_input(&name, field))
                .collect::<Result<_, _>>()?,
        ),
        TypeKind::Enum(values) => ExplicitKind::Enum(
            values
                .values
                .into_iter()
                .map(|value| ExplicitEnumValue {
                    name: value.node.value.node.to_string(),
                    description: text(value.node.description),
                })
                .collect(),
        ),
        TypeKind::Interface(_) => {
            return Err(SchemaError::Unsupported {
                type_name: name,
                message: "interfaces are not supported".into(),
            })
        }
        TypeKind::Union(_) => {
            return Err(SchemaError::Unsupported {
                type_name: name,
                message: "unions are not supported".into(),
            })
        }
    };

    Ok(ExplicitType {
        name,
        description: text(definition.description),
        kind,
    })
}

fn convert_input(
    owner: &str,
    input: Positioned<InputValueDefinition>,
) -> Result<ExplicitInput, SchemaError> {
    let input = input.node;
    let name = input.name.node.to_string();
    Ok(ExplicitInput {
        ty: type_expr(&format!("{owner}.{name}"), &input.ty.node.to_string())?,
        description: text(input.description),
        default_value: input.default_value.map(|value| value.node),
        name,
    })
}

fn type_expr(target: &str, raw: &str) -> Result<TypeExpr, SchemaError> {
    TypeExpr::parse(raw)
        .ok_or_else(|| SchemaError::malformed(target, format!("unparsable type '{raw}'")))
}

fn text(description: Option<Positioned<String>>) -> Option<String> {
    description.map(|d| d.node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_supported_kinds() {
        let types = parse_type_defs(
            r#"
            "A thing for sale"
            type Item {
                id: ID!
                tags(limit: Int = 3): [String!]!
            }
            input NewItem { name: String!, qty: Int }
            enum Status { OPEN CLOSED }
            scalar DateTime
            "#,
        )
        .unwrap();

        let names: Vec<_> = types.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Item", "NewItem", "Status", "DateTime"]);
        assert_eq!(types[0].description.as_deref(), Some("A thing for sale"));

        match &types[0].kind {
            ExplicitKind::Object(fields) => {
                assert_eq!(fields[1].ty.to_string(), "[String!]!");
                assert_eq!(fields[1].arguments[0].default_value, Some(ConstValue::from(3)));
            }
            other => panic!("expected object, got {other:?}"),
        }
        assert!(matches!(&types[2].kind, ExplicitKind::Enum(values) if values.len() == 2));
    }

    #[test]
    fn test_rejects_unsupported_definitions() {
        for sdl in [
            "interface Node { id: ID! }",
            "union Result = Item | Error",
            "extend type Item { extra: String }",
            "type Item implements Node { id: ID! }",
        ] {
            let err = parse_type_defs(sdl).unwrap_err();
            assert!(matches!(err, SchemaError::Unsupported { .. }), "{sdl}: {err}");
        }
    }

    #[test]
    fn test_parse_error() {
        let err = parse_type_defs("type {").unwrap_err();
        assert!(matches!(err, SchemaError::Parse { .. }));
    }
}
