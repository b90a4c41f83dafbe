//! The flow tree: the typed form of the query.
//!
//! Flows are produced from bindings by [crate::tr::route] and split into
//! spaces and codes by [crate::tr::encode].  The shape mirrors the
//! binding tree with naming concerns stripped: sort directions are
//! extracted into `(flow, direction)` pairs and decorations are gone.

use std::rc::Rc;

use crate::catalog::{ColumnRef, Join, TableRef};
use crate::domain::{Domain, Value};
use crate::error::Span;
use crate::syntax::Direction;
use crate::tr::signature::Signature;

#[derive(Debug, Clone)]
pub struct Flow {
    pub kind: FlowKind,
    pub domain: Domain,
    pub span: Option<Span>,
    pub syntax: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FlowKind {
    Root,
    Home { base: Rc<Flow> },
    Table { base: Rc<Flow>, table: TableRef },
    Chain { base: Rc<Flow>, joins: Vec<Join> },
    Column {
        base: Rc<Flow>,
        column: ColumnRef,
        link: Option<Rc<Flow>>,
    },
    Sieve {
        base: Rc<Flow>,
        filter: Rc<Flow>,
    },
    Sort {
        base: Rc<Flow>,
        order: Vec<(Rc<Flow>, Direction)>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Quotient {
        base: Rc<Flow>,
        seed: Rc<Flow>,
        kernels: Vec<Rc<Flow>>,
    },
    Kernel {
        base: Rc<Flow>,
        quotient: Rc<Flow>,
        index: usize,
    },
    Complement {
        base: Rc<Flow>,
        quotient: Rc<Flow>,
    },
    Cover {
        base: Rc<Flow>,
        seed: Rc<Flow>,
    },
    Fork {
        base: Rc<Flow>,
        kernels: Vec<Rc<Flow>>,
    },
    Attach {
        base: Rc<Flow>,
        seed: Rc<Flow>,
        images: Vec<(Rc<Flow>, Rc<Flow>)>,
        condition: Option<Rc<Flow>>,
    },
    Locate {
        base: Rc<Flow>,
        seed: Rc<Flow>,
        images: Vec<(Rc<Flow>, Rc<Flow>)>,
        condition: Option<Rc<Flow>>,
    },
    Clip {
        base: Rc<Flow>,
        seed: Rc<Flow>,
        order: Vec<(Rc<Flow>, Direction)>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    Collect {
        base: Rc<Flow>,
        seed: Rc<Flow>,
    },
    Selection {
        base: Rc<Flow>,
        elements: Vec<Rc<Flow>>,
    },
    Identity {
        base: Rc<Flow>,
        elements: Vec<Rc<Flow>>,
    },
    Literal { base: Rc<Flow>, value: Value },
    Cast { base: Rc<Flow> },
    Rescoping {
        base: Rc<Flow>,
        scope: Rc<Flow>,
    },
    Formula {
        base: Rc<Flow>,
        signature: Signature,
        arguments: Vec<Rc<Flow>>,
    },
}

impl Flow {
    pub fn new(kind: FlowKind, domain: Domain, span: Option<Span>) -> Rc<Flow> {
        Rc::new(Flow {
            kind,
            domain,
            span,
            syntax: None,
        })
    }

    pub fn base(&self) -> Option<&Rc<Flow>> {
        use FlowKind::*;
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
            | Collect { base, .. }
            | Selection { base, .. }
            | Identity { base, .. }
            | Literal { base, .. }
            | Cast { base }
            | Rescoping { base, .. }
            | Formula { base, .. } => Some(base),
        }
    }
}

/// Identity key for pointer-based caches over shared flow nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey(*const Flow);

impl FlowKey {
    pub fn of(flow: &Rc<Flow>) -> FlowKey {
        FlowKey(Rc::as_ptr(flow))
    }
}
