//! Frames and phrases: the SQL-shaped output of the assembler.
//!
//! A frame mirrors one SQL `SELECT`; a phrase is a code resolved to a
//! physical position — a column of a frame, a reference into a nested
//! frame's `SELECT` list, or an embedded subquery.

use crate::catalog::{ColumnRef, TableRef};
use crate::domain::{Domain, Value};
use crate::tr::pipe::Pipe;
use crate::tr::signature::Signature;
use crate::tr::term::Tag;

#[derive(Debug, Clone)]
pub struct Frame {
    /// The tag of the term the frame was assembled from.
    pub tag: Tag,
    pub kind: FrameKind,
}

#[derive(Debug, Clone, strum::AsRefStr)]
pub enum FrameKind {
    /// `SELECT ...` with no `FROM`.
    Scalar,
    Table(TableRef),
    Nested(Box<NestedFrame>),
    Segment(Box<SegmentFrame>),
}

#[derive(Debug, Clone)]
pub struct NestedFrame {
    /// The `FROM` list.
    pub include: Vec<Anchor>,
    /// Correlated subqueries used by the `SELECT` list.
    pub embed: Vec<Frame>,
    pub select: Vec<Phrase>,
    pub where_: Option<Phrase>,
    pub group: Vec<Phrase>,
    pub having: Option<Phrase>,
    pub order: Vec<Phrase>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// A permanent frame is never merged into its parent; row numbering
    /// depends on it keeping its own rows.
    pub is_permanent: bool,
}

/// A segment frame: a nested frame plus the row-shaping pipes consumed
/// by pack, and the dependent segment trees.
#[derive(Debug, Clone)]
pub struct SegmentFrame {
    pub tag: Tag,
    pub nested: NestedFrame,
    pub code_pipes: Vec<Pipe>,
    pub dependent_pipes: Vec<Pipe>,
    pub superkey_pipe: Pipe,
    pub key_pipe: Pipe,
    pub dependents: Vec<SegmentFrame>,
    /// Domains of the `SELECT` items, for the SQL pipe.
    pub domains: Vec<Domain>,
}

/// Connects a child frame into the `FROM` list.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub frame: Frame,
    pub condition: Option<Phrase>,
    pub is_left: bool,
    pub is_right: bool,
}

impl Anchor {
    /// The first frame in the `FROM` list carries no join condition.
    pub fn leading(frame: Frame) -> Anchor {
        Anchor {
            frame,
            condition: None,
            is_left: false,
            is_right: false,
        }
    }

    pub fn is_cross(&self) -> bool {
        self.condition.is_none() && !self.is_left && !self.is_right
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Phrase {
    pub kind: PhraseKind,
    pub domain: Domain,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhraseKind {
    Literal(Value),
    /// A column of a table frame.
    Column { tag: Tag, column: ColumnRef },
    /// The `index`-th item of the `SELECT` list of a nested frame.
    Reference { tag: Tag, index: usize },
    /// The value of an embedded correlated subquery.
    Embedding { tag: Tag },
    Cast { base: Box<Phrase> },
    Formula {
        signature: Signature,
        arguments: Vec<Phrase>,
    },
}

impl Phrase {
    pub fn true_literal() -> Phrase {
        Phrase {
            kind: PhraseKind::Literal(Value::Boolean(true)),
            domain: Domain::Boolean,
            is_nullable: false,
        }
    }

    pub fn literal(value: Value, domain: Domain) -> Phrase {
        let is_nullable = value.is_null();
        Phrase {
            kind: PhraseKind::Literal(value),
            domain,
            is_nullable,
        }
    }
}
