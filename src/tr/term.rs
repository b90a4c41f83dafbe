//! The term algebra: a relational expression tree.
//!
//! Each term promises to produce the rows of its space once it is tied
//! into a complete tree.  A term exports units through its `routes`
//! table, which maps a unit to the tag of the descendant term that can
//! evaluate it; `offsprings` maps every transitive descendant to the
//! immediate child whose subtree contains it.

use std::collections::HashMap;
use std::rc::Rc;

use crate::catalog::TableRef;
use crate::syntax::Direction;
use crate::tr::space::{Code, SegmentExpr, Space, Unit};

/// A unique identifier of a term node within one compilation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub usize);

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "term-{}", self.0)
    }
}

/// An equality pair `lop = rop` forming part of a join condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Joint {
    pub lop: Rc<Code>,
    pub rop: Rc<Code>,
}

impl Joint {
    pub fn new(lop: Rc<Code>, rop: Rc<Code>) -> Joint {
        Joint { lop, rop }
    }

    pub fn with_lop(&self, lop: Rc<Code>) -> Joint {
        Joint {
            lop,
            rop: self.rop.clone(),
        }
    }

    pub fn with_rop(&self, rop: Rc<Code>) -> Joint {
        Joint {
            lop: self.lop.clone(),
            rop,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Term {
    pub tag: Tag,
    pub kind: TermKind,
    pub space: Rc<Space>,
    /// The leftmost axis the term is obliged to export; always inflated.
    pub baseline: Rc<Space>,
    pub routes: HashMap<Unit, Tag>,
    pub offsprings: HashMap<Tag, Tag>,
}

#[derive(Debug, Clone, strum::AsRefStr)]
pub enum TermKind {
    /// `(SELECT ... )`: exactly one row.
    Scalar,
    /// `(SELECT ... FROM <table>)`.
    Table(TableRef),
    /// `(SELECT ... FROM <kid> WHERE <filter>)`.
    Filter { kid: Box<Term>, filter: Rc<Code> },
    /// `(SELECT ... FROM <lkid> (INNER | LEFT OUTER) JOIN <rkid> ON ...)`.
    ///
    /// Right joins are kept for symmetry of the algebra; the compiler
    /// never produces one.
    Join {
        lkid: Box<Term>,
        rkid: Box<Term>,
        joints: Vec<Joint>,
        is_left: bool,
        is_right: bool,
    },
    /// Implants a correlated subquery into the tree; the right child is
    /// a correlation term linked to the left child.
    Embedding {
        lkid: Box<Term>,
        rkid: Box<Term>,
        correlations: Vec<Rc<Code>>,
    },
    Correlation { kid: Box<Term> },
    /// `(SELECT ... FROM <kid> GROUP BY <kernels>)`.
    Projection {
        kid: Box<Term>,
        kernels: Vec<Rc<Code>>,
    },
    /// `(SELECT ... FROM <kid> ORDER BY ... LIMIT ... OFFSET ...)`.
    Order {
        kid: Box<Term>,
        order: Vec<(Rc<Code>, Direction)>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
    /// A no-op wrapper giving compound units a frame to live in.
    Wrapper { kid: Box<Term> },
    /// A wrapper that is never collapsed with the outer frame.
    Permanent { kid: Box<Term> },
    /// The top of one query unit: evaluates the output codes plus the
    /// merge keys, orders its rows, and owns the dependent segment
    /// trees.
    Segment {
        kid: Box<Term>,
        codes: Vec<Rc<Code>>,
        superkeys: Vec<Rc<Code>>,
        keys: Vec<Rc<Code>>,
        order: Vec<(Rc<Code>, Direction)>,
        dependents: Vec<Rc<Term>>,
        /// The segment expression the term was compiled from.
        expr: Rc<SegmentExpr>,
    },
}

impl Term {
    pub fn new(
        tag: Tag,
        kind: TermKind,
        space: Rc<Space>,
        baseline: Rc<Space>,
        routes: HashMap<Unit, Tag>,
    ) -> Term {
        debug_assert!(baseline.is_inflated);
        debug_assert!(space.concludes(&baseline));
        let mut offsprings = HashMap::new();
        for kid in kind.kids() {
            offsprings.insert(kid.tag, kid.tag);
            for offspring in kid.offsprings.keys() {
                offsprings.insert(*offspring, kid.tag);
            }
        }
        Term {
            tag,
            kind,
            space,
            baseline,
            routes,
            offsprings,
        }
    }

    /// The inflation of the term space.
    pub fn backbone(&self) -> Rc<Space> {
        self.space.inflate()
    }

    pub fn is_nullary(&self) -> bool {
        matches!(self.kind, TermKind::Scalar | TermKind::Table(_))
    }

    pub fn kids(&self) -> Vec<&Term> {
        self.kind.kids()
    }
}

impl TermKind {
    pub fn kids(&self) -> Vec<&Term> {
        match self {
            TermKind::Scalar | TermKind::Table(_) => Vec::new(),
            TermKind::Filter { kid, .. }
            | TermKind::Correlation { kid }
            | TermKind::Projection { kid, .. }
            | TermKind::Order { kid, .. }
            | TermKind::Wrapper { kid }
            | TermKind::Permanent { kid }
            | TermKind::Segment { kid, .. } => vec![kid],
            TermKind::Join { lkid, rkid, .. } | TermKind::Embedding { lkid, rkid, .. } => {
                vec![lkid, rkid]
            }
        }
    }
}
