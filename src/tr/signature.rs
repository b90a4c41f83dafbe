//! Formula signatures.
//!
//! A signature identifies the operation of a formula node and fixes the
//! interpretation of its positional argument vector.  The same enum is
//! used at every level of the pipeline: bindings, flows, codes and
//! phrases all carry it.  Where the argument vector splits into several
//! runs (conditional branches, window clauses), the signature records the
//! split so the vector stays self-describing.

use serde::Serialize;

use crate::syntax::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, strum::AsRefStr)]
pub enum Signature {
    /// `lop = rop` / `lop != rop`; args: `[lop, rop]`.
    IsEqual { polarity: Polarity },
    /// `lop == rop` / `lop !== rop`; never nullable; args: `[lop, rop]`.
    IsTotallyEqual { polarity: Polarity },
    /// `lop = {rop, ...}`; args: `[lop, rop...]`.
    IsIn { polarity: Polarity },
    /// `is_null(op)` / `!is_null(op)`; args: `[op]`.
    IsNull { polarity: Polarity },
    /// `if_null(lop, rop)`; args: `[lop, rop]`.
    IfNull,
    /// `null_if(lop, rop)`; args: `[lop, rop]`.
    NullIf,
    /// `lop < rop` and friends; args: `[lop, rop]`.
    Compare { relation: Relation },
    /// Boolean connectives; args: `[ops...]` / `[op]`.
    And,
    Or,
    Not,
    /// Arithmetic; args: `[lop, rop]` / `[op]`.
    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    /// `lop + rop` on text; args: `[lop, rop]`.
    Concatenate,
    /// Aggregate formulas evaluated in a plural frame; args: `[op]`.
    Count,
    Sum,
    Min,
    Max,
    /// `exists(op)` over a correlated subquery; args: `[op]`.
    Exists,
    /// Bind-level quantifier lowered by encode; args: `[op]`.
    Quantify { polarity: Polarity },
    /// Bind-level aggregate marker lowered by encode; args: `[op]`.
    Aggregate { op: AggregateOp },
    /// String search; lowered to [Signature::Like] by rewrite; args:
    /// `[lop, rop]`.
    Contains { polarity: Polarity },
    /// Prefix search; lowered to [Signature::Like]; args: `[lop, rop]`.
    HasPrefix,
    /// `lop LIKE rop ESCAPE '\'`; args: `[lop, rop]`.
    Like { polarity: Polarity },
    /// `replace(op, old, new)`; args: `[op, old, new]`.
    Replace,
    /// `substring(op, start[, length])`; args: `[op, start(, length)]`.
    Substring { has_length: bool },
    /// `length(op)`; args: `[op]`.  Lowered by rewrite to
    /// `if_null(char_length(op), 0)`.
    Length,
    /// `CHARACTER_LENGTH(op)`; args: `[op]`.
    CharLength,
    /// `head(op[, length])` and friends; lowered to
    /// [Signature::Substring] by rewrite.
    Head { has_length: bool },
    Tail { has_length: bool },
    /// `slice(op[, left][, right])`; args: `[op, left, right]` with
    /// absent bounds passed as null literals.
    Slice,
    /// `at(op, index[, length])`; args: `[op, index(, length)]`.
    At { has_length: bool },
    /// `if(p1, c1, ..., pn, cn[, alternative])`; args: predicates, then
    /// consequents, then the optional alternative.
    If {
        branches: usize,
        has_alternative: bool,
    },
    /// An `ORDER BY` item; args: `[base]`.
    SortDirection { direction: Direction },
    /// `ROW_NUMBER() OVER (PARTITION BY ... ORDER BY ...)`; args:
    /// partition expressions followed by order expressions.
    RowNumber { partition: usize, order: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn negated(self) -> Polarity {
        match self {
            Polarity::Positive => Polarity::Negative,
            Polarity::Negative => Polarity::Positive,
        }
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Polarity::Positive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Relation {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Relation {
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Gt => ">",
            Relation::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AggregateOp {
    Count,
    Sum,
    Min,
    Max,
}

impl Signature {
    /// Formulas that aggregate a plural operand; recognized by encode.
    pub fn is_aggregate_like(&self) -> bool {
        matches!(
            self,
            Signature::Aggregate { .. } | Signature::Quantify { .. }
        )
    }
}
