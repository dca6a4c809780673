//! Typed template parameter values and their SQL rendering.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{QuarryError, Result};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Returns true if `value` is safe to splice into SQL as a bare identifier.
pub fn is_valid_identifier(value: &str) -> bool {
    identifier_pattern().is_match(value)
}

/// A single literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl Scalar {
    fn render(&self, name: &str) -> Result<String> {
        Ok(match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Int(i) => i.to_string(),
            // Debug keeps the fraction or exponent, so the literal stays a double.
            Self::Float(f) if f.is_finite() => format!("{f:?}"),
            Self::Float(f) => {
                return Err(QuarryError::InvalidParameter {
                    name: name.to_string(),
                    reason: format!("{f} has no SQL literal"),
                })
            }
            Self::String(s) => quote(s),
            Self::Date(d) => format!("DATE '{}'", d.format("%Y-%m-%d")),
            Self::Timestamp(ts) => {
                let pattern = if ts.nanosecond() == 0 {
                    "%Y-%m-%d %H:%M:%S"
                } else {
                    "%Y-%m-%d %H:%M:%S%.3f"
                };
                format!("TIMESTAMP '{}'", ts.format(pattern))
            }
        })
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// What an identifier parameter names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Schema,
    Table,
    Database,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Schema => "schema",
            Self::Table => "table",
            Self::Database => "database",
        })
    }
}

/// A value bound to a `${name}` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    /// Rendered as an escaped literal.
    Scalar(Scalar),
    /// Rendered as a parenthesized tuple of literals.
    List(Vec<Scalar>),
    /// Rendered unquoted after validation.
    Identifier { kind: IdentifierKind, name: String },
    /// A dot-separated name such as `db.table`; each part is validated.
    QualifiedName(Vec<String>),
    /// Rendered verbatim. Never pass untrusted input here.
    Raw(String),
}

impl TemplateValue {
    pub fn schema(name: impl Into<String>) -> Self {
        Self::Identifier {
            kind: IdentifierKind::Schema,
            name: name.into(),
        }
    }

    pub fn table(name: impl Into<String>) -> Self {
        Self::Identifier {
            kind: IdentifierKind::Table,
            name: name.into(),
        }
    }

    pub fn database(name: impl Into<String>) -> Self {
        Self::Identifier {
            kind: IdentifierKind::Database,
            name: name.into(),
        }
    }

    pub fn raw(expression: impl Into<String>) -> Self {
        Self::Raw(expression.into())
    }

    pub fn null() -> Self {
        Self::Scalar(Scalar::Null)
    }

    /// Builds a list from anything convertible to scalars.
    pub fn list<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Scalar>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    /// Renders the value as SQL text. `name` is the placeholder it is bound
    /// to, used in error messages.
    pub fn render(&self, name: &str) -> Result<String> {
        match self {
            Self::Scalar(scalar) => scalar.render(name),
            Self::List(values) if values.is_empty() => Ok("(NULL)".to_string()),
            Self::List(values) => {
                let rendered = values
                    .iter()
                    .map(|v| v.render(name))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("({})", rendered.join(", ")))
            }
            Self::Identifier { name: value, .. } => {
                validate_identifier(name, value)?;
                Ok(value.clone())
            }
            Self::QualifiedName(parts) => {
                if parts.is_empty() {
                    return Err(QuarryError::InvalidIdentifier {
                        name: name.to_string(),
                        value: String::new(),
                    });
                }
                for part in parts {
                    validate_identifier(name, part)?;
                }
                Ok(parts.join("."))
            }
            Self::Raw(expression) => Ok(expression.clone()),
        }
    }
}

fn validate_identifier(name: &str, value: &str) -> Result<()> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(QuarryError::InvalidIdentifier {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(v as i64)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::String(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::String(v.to_string())
    }
}

impl From<NaiveDate> for Scalar {
    fn from(v: NaiveDate) -> Self {
        Scalar::Date(v)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(v: NaiveDateTime) -> Self {
        Scalar::Timestamp(v)
    }
}

impl<T> From<Option<T>> for Scalar
where
    T: Into<Scalar>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Scalar::Null,
        }
    }
}

macro_rules! scalar_template_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for TemplateValue {
                fn from(v: $ty) -> Self {
                    TemplateValue::Scalar(v.into())
                }
            }
        )*
    };
}

scalar_template_value!(Scalar, bool, i32, i64, f64, String, &str, NaiveDate, NaiveDateTime);

impl<T> From<Option<T>> for TemplateValue
where
    T: Into<Scalar>,
{
    fn from(v: Option<T>) -> Self {
        TemplateValue::Scalar(v.into())
    }
}
