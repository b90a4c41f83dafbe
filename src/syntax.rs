//! The input syntax tree.
//!
//! The compiler does not parse query text; the caller hands it a syntax
//! tree built from identifiers, applications, operators, compositions,
//! selections and literals.  The builder methods make programmatic
//! construction read close to the query notation:
//!
//! ```
//! use htsql_compiler::syntax::{ident, apply};
//!
//! // school{code, count(department)}
//! let q = ident("school").select(vec![
//!     ident("code"),
//!     apply("count", vec![ident("department")]),
//! ]);
//! ```

use serde::Serialize;

use crate::error::Span;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Syntax {
    pub kind: SyntaxKind,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyntaxKind {
    /// A name to resolve in the current scope.
    Identifier(String),
    /// A quoted or numeric literal.
    Literal { text: String, kind: LiteralKind },
    /// A function application: `count(department)`.
    Apply {
        name: String,
        arguments: Vec<Syntax>,
    },
    /// An operator application: `credits>3`, `a&b`, `!p`.
    Operator {
        name: String,
        arguments: Vec<Syntax>,
    },
    /// Flow composition: `school.department`.
    Compose { larm: Box<Syntax>, rarm: Box<Syntax> },
    /// Selection: `school{code, name}`.
    Select {
        arm: Box<Syntax>,
        fields: Vec<Syntax>,
    },
    /// Filtering: `school?campus='north'`.
    Sieve { arm: Box<Syntax>, filter: Box<Syntax> },
    /// Grouping: `department^school`.
    Quotient {
        arm: Box<Syntax>,
        kernels: Vec<Syntax>,
    },
    /// The complement marker `^` inside a quotient scope.
    Complement,
    /// A nested segment: `/department`.
    Collect { arm: Box<Syntax> },
    /// Row lookup by identity: `school['art']`.
    Locate {
        arm: Box<Syntax>,
        values: Vec<Syntax>,
    },
    /// An explicit sort direction mark: `name+`, `name-`.
    Direction {
        arm: Box<Syntax>,
        direction: Direction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LiteralKind {
    Text,
    Integer,
    Decimal,
    Float,
}

/// Sort direction; `+1`/`-1` in the query notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Syntax {
    pub fn new(kind: SyntaxKind) -> Syntax {
        Syntax { kind, span: None }
    }

    pub fn with_span(mut self, span: Span) -> Syntax {
        self.span = Some(span);
        self
    }

    pub fn compose(self, rarm: Syntax) -> Syntax {
        Syntax::new(SyntaxKind::Compose {
            larm: Box::new(self),
            rarm: Box::new(rarm),
        })
    }

    pub fn select(self, fields: Vec<Syntax>) -> Syntax {
        Syntax::new(SyntaxKind::Select {
            arm: Box::new(self),
            fields,
        })
    }

    pub fn sieve(self, filter: Syntax) -> Syntax {
        Syntax::new(SyntaxKind::Sieve {
            arm: Box::new(self),
            filter: Box::new(filter),
        })
    }

    pub fn quotient(self, kernels: Vec<Syntax>) -> Syntax {
        Syntax::new(SyntaxKind::Quotient {
            arm: Box::new(self),
            kernels,
        })
    }

    pub fn collect(self) -> Syntax {
        Syntax::new(SyntaxKind::Collect {
            arm: Box::new(self),
        })
    }

    pub fn locate(self, values: Vec<Syntax>) -> Syntax {
        Syntax::new(SyntaxKind::Locate {
            arm: Box::new(self),
            values,
        })
    }

    pub fn asc(self) -> Syntax {
        Syntax::new(SyntaxKind::Direction {
            arm: Box::new(self),
            direction: Direction::Ascending,
        })
    }

    pub fn desc(self) -> Syntax {
        Syntax::new(SyntaxKind::Direction {
            arm: Box::new(self),
            direction: Direction::Descending,
        })
    }

    /// The name a selection field is exported under.
    pub fn field_name(&self) -> Option<&str> {
        match &self.kind {
            SyntaxKind::Identifier(name) => Some(name),
            SyntaxKind::Apply { name, .. } => Some(name),
            SyntaxKind::Compose { rarm, .. } => rarm.field_name(),
            SyntaxKind::Select { arm, .. }
            | SyntaxKind::Sieve { arm, .. }
            | SyntaxKind::Collect { arm }
            | SyntaxKind::Locate { arm, .. }
            | SyntaxKind::Direction { arm, .. } => arm.field_name(),
            SyntaxKind::Quotient { kernels, .. } => {
                kernels.first().and_then(|kernel| kernel.field_name())
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Syntax {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SyntaxKind::Identifier(name) => write!(f, "{name}"),
            SyntaxKind::Literal { text, kind } => match kind {
                LiteralKind::Text => write!(f, "'{}'", text.replace('\'', "''")),
                _ => write!(f, "{text}"),
            },
            SyntaxKind::Apply { name, arguments } | SyntaxKind::Operator { name, arguments } => {
                if arguments.len() == 2 && !name.chars().any(|c| c.is_alphanumeric()) {
                    write!(f, "{}{}{}", arguments[0], name, arguments[1])
                } else {
                    let arguments: Vec<String> =
                        arguments.iter().map(|a| a.to_string()).collect();
                    write!(f, "{name}({})", arguments.join(","))
                }
            }
            SyntaxKind::Compose { larm, rarm } => write!(f, "{larm}.{rarm}"),
            SyntaxKind::Select { arm, fields } => {
                let fields: Vec<String> = fields.iter().map(|a| a.to_string()).collect();
                write!(f, "{arm}{{{}}}", fields.join(","))
            }
            SyntaxKind::Sieve { arm, filter } => write!(f, "{arm}?{filter}"),
            SyntaxKind::Quotient { arm, kernels } => {
                let kernels: Vec<String> = kernels.iter().map(|a| a.to_string()).collect();
                write!(f, "{arm}^{{{}}}", kernels.join(","))
            }
            SyntaxKind::Complement => write!(f, "^"),
            SyntaxKind::Collect { arm } => write!(f, "/{arm}"),
            SyntaxKind::Locate { arm, values } => {
                let values: Vec<String> = values.iter().map(|a| a.to_string()).collect();
                write!(f, "{arm}[{}]", values.join("."))
            }
            SyntaxKind::Direction { arm, direction } => match direction {
                Direction::Ascending => write!(f, "{arm}+"),
                Direction::Descending => write!(f, "{arm}-"),
            },
        }
    }
}

pub fn ident<S: Into<String>>(name: S) -> Syntax {
    Syntax::new(SyntaxKind::Identifier(name.into()))
}

pub fn apply<S: Into<String>>(name: S, arguments: Vec<Syntax>) -> Syntax {
    Syntax::new(SyntaxKind::Apply {
        name: name.into(),
        arguments,
    })
}

pub fn operator<S: Into<String>>(name: S, arguments: Vec<Syntax>) -> Syntax {
    Syntax::new(SyntaxKind::Operator {
        name: name.into(),
        arguments,
    })
}

pub fn text_literal<S: Into<String>>(text: S) -> Syntax {
    Syntax::new(SyntaxKind::Literal {
        text: text.into(),
        kind: LiteralKind::Text,
    })
}

pub fn integer_literal(value: i64) -> Syntax {
    Syntax::new(SyntaxKind::Literal {
        text: value.to_string(),
        kind: LiteralKind::Integer,
    })
}

pub fn complement() -> Syntax {
    Syntax::new(SyntaxKind::Complement)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_reads_like_the_query_notation() {
        let q = ident("school")
            .sieve(operator(">", vec![
                apply("count", vec![ident("department")]),
                integer_literal(3),
            ]))
            .select(vec![ident("code")]);
        assert_eq!(q.to_string(), "school?count(department)>3{code}");
    }

    #[test]
    fn field_names_come_from_the_head_of_the_arm() {
        assert_eq!(ident("code").field_name(), Some("code"));
        assert_eq!(
            apply("count", vec![ident("department")]).field_name(),
            Some("count")
        );
        assert_eq!(
            ident("department").select(vec![ident("code")]).field_name(),
            Some("department")
        );
    }
}
