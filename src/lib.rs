//! Compiler for the HTSQL query language.
//! Targets SQL and exposes every intermediate representation of the
//! translation pipeline.
//!
//! You probably want to start with the [compile] wrapper function.
//!
//! For more granular access, refer to this diagram:
//! ```ascii
//!          Syntax
//!            │ (bind)
//!            ▼
//!         Binding          name resolution against the catalog
//!            │ (route)
//!            ▼
//!          Flow            the typed query tree
//!            │ (encode)
//!            ▼
//!       Space + Code       data flows and value expressions
//!            │ (rewrite)
//!            ▼
//!       Space + Code′      simplified, unmasked, recombined
//!            │ (compile)
//!            ▼
//!          Term            the relational join tree
//!            │ (assemble)
//!            ▼
//!          Frame           SELECT/FROM/WHERE/... clauses
//!            │ (serialize)
//!            ▼
//!        SQL + Pipe        executable plan
//! ```

// The error type carries a note stack and is passed around by value;
// this is not a performance-sensitive crate, so the large variants are
// fine.
#![allow(clippy::result_large_err)]

pub mod catalog;
pub mod cmd;
pub mod domain;
mod error;
pub mod syntax;
pub mod tr;

#[cfg(test)]
mod test;

use std::rc::Rc;

pub use error::{downcast, guard, Error, ErrorMessage, ErrorMessages, Reason, Result, Span};
pub use tr::pipe::{produce, Database, Plan, Product, Transaction};

use catalog::Catalog;
use syntax::Syntax;

/// Compile a query into an executable plan.
///
/// This is a wrapper for:
/// - [plan_of_syntax] — the whole pipeline with internal errors;
/// - [error::downcast] — collapse internal errors into messages.
pub fn compile(syntax: &Syntax, catalog: &Catalog) -> Result<Plan, ErrorMessages> {
    plan_of_syntax(syntax, catalog).map_err(downcast)
}

/// Run the full pipeline, returning internal errors.
pub fn plan_of_syntax(syntax: &Syntax, catalog: &Catalog) -> Result<Plan> {
    let binding = tr::bind::bind(syntax, catalog)?;
    let flow = tr::route::route(&binding)?;
    plan_of_flow(&flow, catalog)
}

/// Compile an already routed flow tree.
pub fn plan_of_flow(flow: &Rc<tr::flow::Flow>, catalog: &Catalog) -> Result<Plan> {
    let segment = tr::encode::encode(flow, catalog)?;
    let segment = tr::rewrite::rewrite(&segment, catalog)?;
    let term = tr::compile::compile(&segment, catalog)?;
    let frame = tr::assemble::assemble(&term, catalog)?;
    let (sql, rows) = tr::serialize::serialize(&frame, catalog)?;
    let shape = tr::pack::pack(flow, &frame)?;
    let meta = tr::pack::profile(flow);
    Ok(Plan {
        meta,
        data: rows.compose(shape),
        sql,
    })
}

/// Recognize a command application and compile its feed.
///
/// `sql(...)` compiles the feed without running it — the caller reads
/// [Plan::sql]; format commands only carry the format name, rendering
/// is outside the core.
pub fn act(syntax: &Syntax, catalog: &Catalog) -> Result<Plan, ErrorMessages> {
    let command = cmd::recognize(syntax).map_err(downcast)?;
    let feed = command
        .feed_syntax()
        .ok_or_else(|| downcast(Error::simple("expected a query to compile").into()))?;
    compile(feed, catalog)
}
