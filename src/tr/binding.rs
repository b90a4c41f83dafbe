//! The binding tree: the name-resolved form of the query.
//!
//! Bindings are produced by the binder and consumed by [crate::tr::route].
//! Every node keeps the scope it was resolved in as its `base`, the
//! domain of the values it produces and the source span of the syntax it
//! came from.

use std::rc::Rc;

use crate::catalog::{ColumnRef, Join, TableRef};
use crate::domain::{Domain, Value};
use crate::error::Span;
use crate::syntax::Direction;
use crate::tr::signature::Signature;

#[derive(Debug, Clone)]
pub struct Binding {
    pub kind: BindingKind,
    pub domain: Domain,
    pub span: Option<Span>,
    /// Source text for profiles and error messages.
    pub syntax: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BindingKind {
    /// The initial scope; also the home class of the database.
    Root,
    /// An explicit link back to the scalar class.
    Home { base: Rc<Binding> },
    /// All rows of a table.
    Table { base: Rc<Binding>, table: TableRef },
    /// Rows of a linked table reached by one or more joins.
    Chain {
        base: Rc<Binding>,
        joins: Vec<Join>,
    },
    /// A column of the scope table; `link` is set when the column also
    /// names a direct join.
    Column {
        base: Rc<Binding>,
        column: ColumnRef,
        link: Option<Rc<Binding>>,
    },
    Sieve {
        base: Rc<Binding>,
        filter: Rc<Binding>,
    },
    Sort {
        base: Rc<Binding>,
        order: Vec<Rc<Binding>>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Quotient {
        base: Rc<Binding>,
        seed: Rc<Binding>,
        kernels: Vec<Rc<Binding>>,
    },
    /// A reference to one kernel expression of an enclosing quotient.
    Kernel {
        base: Rc<Binding>,
        quotient: Rc<Binding>,
        index: usize,
    },
    /// The complement `^` of a quotient scope.
    Complement {
        base: Rc<Binding>,
        quotient: Rc<Binding>,
    },
    /// Masks a subquery as one opaque axis.
    Cover {
        base: Rc<Binding>,
        seed: Rc<Binding>,
    },
    Fork {
        base: Rc<Binding>,
        kernels: Vec<Rc<Binding>>,
    },
    Attach {
        base: Rc<Binding>,
        seed: Rc<Binding>,
        images: Vec<(Rc<Binding>, Rc<Binding>)>,
        condition: Option<Rc<Binding>>,
    },
    Locate {
        base: Rc<Binding>,
        seed: Rc<Binding>,
        images: Vec<(Rc<Binding>, Rc<Binding>)>,
        condition: Option<Rc<Binding>>,
    },
    Clip {
        base: Rc<Binding>,
        seed: Rc<Binding>,
        order: Vec<Rc<Binding>>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Selection {
        base: Rc<Binding>,
        elements: Vec<Rc<Binding>>,
    },
    Identity {
        base: Rc<Binding>,
        elements: Vec<Rc<Binding>>,
    },
    Literal { base: Rc<Binding>, value: Value },
    /// A cast to `self.domain`.
    Cast { base: Rc<Binding> },
    Formula {
        base: Rc<Binding>,
        signature: Signature,
        arguments: Vec<Rc<Binding>>,
    },
    /// A nested segment.
    Collect {
        base: Rc<Binding>,
        seed: Rc<Binding>,
    },
    /// Evaluates the base expression in another scope.
    Rescoping {
        base: Rc<Binding>,
        scope: Rc<Binding>,
    },
    /// A sort-direction decoration; transparent except to Route.
    Decorate {
        base: Rc<Binding>,
        direction: Direction,
    },
}

impl Binding {
    pub fn new(kind: BindingKind, domain: Domain) -> Rc<Binding> {
        Rc::new(Binding {
            kind,
            domain,
            span: None,
            syntax: None,
        })
    }

    pub fn with_syntax(
        kind: BindingKind,
        domain: Domain,
        span: Option<Span>,
        syntax: Option<String>,
    ) -> Rc<Binding> {
        Rc::new(Binding {
            kind,
            domain,
            span,
            syntax,
        })
    }

    /// The scope the binding was resolved in, when it has one.
    pub fn base(&self) -> Option<&Rc<Binding>> {
        use BindingKind::*;
        match &self.kind {
            Root => None,
            Home { base }
            | Table { base, .. }
            | Chain { base, .. }
            | Column { base, .. }
            | Sieve { base, .. }
            | Sort { base, .. }
            | Quotient { base, .. }
            | Kernel { base, .. }
            | Complement { base, .. }
            | Cover { base, .. }
            | Fork { base, .. }
            | Attach { base, .. }
            | Locate { base, .. }
            | Clip { base, .. }
            | Selection { base, .. }
            | Identity { base, .. }
            | Literal { base, .. }
            | Cast { base }
            | Formula { base, .. }
            | Collect { base, .. }
            | Rescoping { base, .. }
            | Decorate { base, .. } => Some(base),
        }
    }
}
