//! Value domains of the query language.
//!
//! A domain describes the type of values produced by an expression.
//! Primitive domains map to SQL column types; composite domains (list,
//! record, identity, entity) only exist in the output shape and never
//! reach the generated SQL.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use enum_as_inner::EnumAsInner;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::catalog::TableRef;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, EnumAsInner)]
pub enum Domain {
    Boolean,
    Integer,
    Decimal {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Float,
    Text {
        length: Option<u32>,
        is_varying: bool,
    },
    Enum(Vec<String>),
    Date,
    Time,
    DateTime,
    /// Literals whose type has not been established yet.
    Untyped,
    /// The absence of a value.
    Void,
    /// An unknown user type; values pass through the compiler opaquely.
    Opaque,
    List(Box<Domain>),
    Record(Vec<Profile>),
    Identity(Vec<Domain>),
    Entity(TableRef),
}

impl Domain {
    /// The generic decimal domain.
    pub fn decimal() -> Domain {
        Domain::Decimal {
            precision: None,
            scale: None,
        }
    }

    /// The generic variable-length text domain.
    pub fn text() -> Domain {
        Domain::Text {
            length: None,
            is_varying: true,
        }
    }

    /// Domains that values of SQL rows may take.
    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            Domain::List(_) | Domain::Record(_) | Domain::Identity(_) | Domain::Entity(_)
        )
    }

    /// Parses a serialized untyped literal into a value of this domain.
    pub fn parse(&self, text: &str) -> Result<Value> {
        static DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
        static TIME: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^\d{2}:\d{2}(:\d{2}(\.\d+)?)?$").unwrap());
        static DATETIME: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}(:\d{2}(\.\d+)?)?$").unwrap()
        });

        let cannot = || -> anyhow::Error {
            Error::simple(format!("unable to parse {text:?} as {self}")).into()
        };
        Ok(match self {
            Domain::Boolean => match text {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(cannot()),
            },
            Domain::Integer => Value::Integer(text.parse().map_err(|_| cannot())?),
            Domain::Decimal { .. } => {
                // Validated with a float parse, stored verbatim.
                text.parse::<f64>().map_err(|_| cannot())?;
                Value::Decimal(text.to_owned())
            }
            Domain::Float => Value::Float(text.parse().map_err(|_| cannot())?),
            Domain::Text { .. } | Domain::Untyped => Value::Text(text.to_owned()),
            Domain::Enum(labels) => {
                if !labels.iter().any(|label| label == text) {
                    return Err(cannot());
                }
                Value::Text(text.to_owned())
            }
            Domain::Date => {
                if !DATE.is_match(text) {
                    return Err(cannot());
                }
                Value::Date(text.to_owned())
            }
            Domain::Time => {
                if !TIME.is_match(text) {
                    return Err(cannot());
                }
                Value::Time(text.to_owned())
            }
            Domain::DateTime => {
                if !DATETIME.is_match(text) {
                    return Err(cannot());
                }
                Value::DateTime(text.to_owned())
            }
            _ => return Err(cannot()),
        })
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Boolean => write!(f, "boolean"),
            Domain::Integer => write!(f, "integer"),
            Domain::Decimal { .. } => write!(f, "decimal"),
            Domain::Float => write!(f, "float"),
            Domain::Text { .. } => write!(f, "text"),
            Domain::Enum(_) => write!(f, "enum"),
            Domain::Date => write!(f, "date"),
            Domain::Time => write!(f, "time"),
            Domain::DateTime => write!(f, "datetime"),
            Domain::Untyped => write!(f, "untyped"),
            Domain::Void => write!(f, "void"),
            Domain::Opaque => write!(f, "opaque"),
            Domain::List(element) => write!(f, "list({element})"),
            Domain::Record(fields) => write!(f, "record({})", fields.len()),
            Domain::Identity(labels) => write!(f, "identity({})", labels.len()),
            Domain::Entity(_) => write!(f, "entity"),
        }
    }
}

/// Describes one field of the output shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Profile {
    pub domain: Domain,
    /// The field name, when the selection gives it one.
    pub tag: Option<String>,
    /// A human-readable column title.
    pub header: Option<String>,
    /// The source text the field was built from.
    pub syntax: Option<String>,
    /// Catalog labels navigated to reach the field.
    pub path: Vec<String>,
}

impl Profile {
    pub fn new(domain: Domain) -> Profile {
        Profile {
            domain,
            tag: None,
            header: None,
            syntax: None,
            path: Vec::new(),
        }
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Profile {
        let tag = tag.into();
        if self.header.is_none() {
            self.header = Some(tag.clone());
        }
        self.tag = Some(tag);
        self
    }
}

/// A literal or row value.
#[derive(Debug, Clone, Serialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Kept in serialized form; scale is engine business.
    Decimal(String),
    Text(String),
    Date(String),
    Time(String),
    DateTime(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

// Floats compare by bit pattern so that values can serve as cache keys.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Decimal(a), Decimal(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (Time(a), Time(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(x) => x.to_bits().hash(state),
            Value::Decimal(s)
            | Value::Text(s)
            | Value::Date(s)
            | Value::Time(s)
            | Value::DateTime(s) => s.hash(state),
        }
    }
}

/// Nested data produced by executing a plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Data {
    Null,
    Value(Value),
    Record(Rc<Vec<Data>>),
    List(Rc<Vec<Data>>),
}

impl Data {
    pub fn record(fields: Vec<Data>) -> Data {
        Data::Record(Rc::new(fields))
    }

    pub fn list(items: Vec<Data>) -> Data {
        Data::List(Rc::new(items))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn untyped_literals_parse_per_domain() {
        assert_eq!(
            Domain::Integer.parse("42").unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            Domain::Boolean.parse("true").unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            Domain::Date.parse("2010-04-15").unwrap(),
            Value::Date("2010-04-15".into())
        );
        assert!(Domain::Date.parse("2010-4-15").is_err());
        assert!(Domain::Integer.parse("forty-two").is_err());
    }

    #[test]
    fn composite_domains_do_not_parse() {
        assert!(Domain::List(Box::new(Domain::Integer)).parse("[]").is_err());
    }
}
