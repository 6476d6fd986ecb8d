//! Argument validation run before a resolver is invoked.

use std::fmt;

use async_graphql_value::ConstValue;
use indexmap::IndexMap;

use crate::error::{ValidationError, Violation};
use crate::handler::Args;
use crate::loader::BoxFuture;

pub trait ArgsValidator: Send + Sync {
    /// Checks the raw arguments of one field invocation.
    fn validate<'a>(&'a self, args: &'a Args) -> BoxFuture<'a, Result<(), ValidationError>>;
}

/// Adapts a synchronous closure into an [`ArgsValidator`].
pub fn validator_fn<F>(check: F) -> FnValidator<F>
where
    F: Fn(&Args) -> Result<(), ValidationError> + Send + Sync,
{
    FnValidator(check)
}

pub struct FnValidator<F>(F);

impl<F> ArgsValidator for FnValidator<F>
where
    F: Fn(&Args) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate<'a>(&'a self, args: &'a Args) -> BoxFuture<'a, Result<(), ValidationError>> {
        let result = (self.0)(args);
        Box::pin(async move { result })
    }
}

impl<F> fmt::Debug for FnValidator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnValidator")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Required,
    MinLength(usize),
    MaxLength(usize),
    Min(f64),
    Max(f64),
    OneOf(Vec<String>),
}

impl Rule {
    fn check(&self, value: Option<&ConstValue>) -> Option<String> {
        let value = match value {
            None | Some(ConstValue::Null) => {
                return matches!(self, Rule::Required).then(|| "is required".to_string());
            }
            Some(value) => value,
        };

        match self {
            Rule::Required => None,
            Rule::MinLength(min) => match length(value) {
                Some(len) if len < *min => Some(format!("must have at least {min} characters or items")),
                Some(_) => None,
                None => Some("must be a string or a list".to_string()),
            },
            Rule::MaxLength(max) => match length(value) {
                Some(len) if len > *max => Some(format!("must have at most {max} characters or items")),
                Some(_) => None,
                None => Some("must be a string or a list".to_string()),
            },
            Rule::Min(min) => match number(value) {
                Some(n) if n < *min => Some(format!("must be at least {min}")),
                Some(_) => None,
                None => Some("must be a number".to_string()),
            },
            Rule::Max(max) => match number(value) {
                Some(n) if n > *max => Some(format!("must be at most {max}")),
                Some(_) => None,
                None => Some("must be a number".to_string()),
            },
            Rule::OneOf(allowed) => {
                let text = match value {
                    ConstValue::String(s) => Some(s.as_str()),
                    ConstValue::Enum(name) => Some(name.as_str()),
                    _ => None,
                };
                match text {
                    Some(text) if allowed.iter().any(|a| a == text) => None,
                    _ => Some(format!("must be one of: {}", allowed.join(", "))),
                }
            }
        }
    }
}

fn length(value: &ConstValue) -> Option<usize> {
    match value {
        ConstValue::String(s) => Some(s.chars().count()),
        ConstValue::List(items) => Some(items.len()),
        _ => None,
    }
}

fn number(value: &ConstValue) -> Option<f64> {
    match value {
        ConstValue::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Declarative validator: a list of rules per argument path.
///
/// Paths are dotted (`input.name`) to reach into input objects. Rules of a
/// path run in order and only the first failure is reported, so the result
/// carries at most one violation per path.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    fields: IndexMap<String, Vec<Rule>>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, path: impl Into<String>, rule: Rule) -> Self {
        self.fields.entry(path.into()).or_default().push(rule);
        self
    }

    pub fn check(&self, args: &Args) -> Vec<Violation> {
        self.fields
            .iter()
            .filter_map(|(path, rules)| {
                let value = lookup(args, path);
                rules
                    .iter()
                    .find_map(|rule| rule.check(value))
                    .map(|message| Violation::new(path.clone(), message))
            })
            .collect()
    }
}

fn lookup<'a>(args: &'a Args, path: &str) -> Option<&'a ConstValue> {
    let mut segments = path.split('.');
    let mut current = args.get(segments.next()?)?;
    for segment in segments {
        match current {
            ConstValue::Object(object) => current = object.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

impl ArgsValidator for Rules {
    fn validate<'a>(&'a self, args: &'a Args) -> BoxFuture<'a, Result<(), ValidationError>> {
        let violations = self.check(args);
        Box::pin(async move {
            if violations.is_empty() {
                Ok(())
            } else {
                Err(ValidationError::new(violations))
            }
        })
    }
}
