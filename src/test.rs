//! Pipeline tests over the canonical school schema.

use std::collections::HashSet;
use std::rc::Rc;

use crate::catalog::Catalog;
use crate::domain::Domain;
use crate::error::Error;
use crate::syntax::{apply, ident, integer_literal, operator, text_literal, Syntax};
use crate::tr;
use crate::tr::space::SegmentExpr;
use crate::tr::term::{Tag, Term};

pub(crate) fn school_catalog() -> Catalog {
    let mut catalog = Catalog::new();

    let school = catalog.add_table("school");
    catalog.add_column(school, "code", Domain::text(), false);
    catalog.add_column(school, "name", Domain::text(), false);
    catalog.add_column(school, "campus", Domain::text(), true);
    catalog.add_primary_key(school, &["code"]);

    let department = catalog.add_table("department");
    catalog.add_column(department, "code", Domain::text(), false);
    catalog.add_column(department, "name", Domain::text(), false);
    catalog.add_column(department, "school_code", Domain::text(), true);
    catalog.add_primary_key(department, &["code"]);
    catalog.add_foreign_key(department, &["school_code"], school, &["code"]);

    let program = catalog.add_table("program");
    catalog.add_column(program, "school_code", Domain::text(), false);
    catalog.add_column(program, "code", Domain::text(), false);
    catalog.add_column(program, "title", Domain::text(), false);
    catalog.add_column(program, "degree", Domain::text(), true);
    catalog.add_primary_key(program, &["school_code", "code"]);
    catalog.add_foreign_key(program, &["school_code"], school, &["code"]);

    let course = catalog.add_table("course");
    catalog.add_column(course, "department_code", Domain::text(), false);
    catalog.add_column(course, "no", Domain::Integer, false);
    catalog.add_column(course, "title", Domain::text(), false);
    catalog.add_column(course, "credits", Domain::Integer, true);
    catalog.add_primary_key(course, &["department_code", "no"]);
    catalog.add_foreign_key(course, &["department_code"], department, &["code"]);

    catalog
}

fn encoded(syntax: &Syntax, catalog: &Catalog) -> Rc<SegmentExpr> {
    let binding = tr::bind::bind(syntax, catalog).unwrap();
    let flow = tr::route::route(&binding).unwrap();
    tr::encode::encode(&flow, catalog).unwrap()
}

fn compiled(syntax: &Syntax, catalog: &Catalog) -> Term {
    let segment = encoded(syntax, catalog);
    let segment = tr::rewrite::rewrite(&segment, catalog).unwrap();
    tr::compile::compile(&segment, catalog).unwrap()
}

fn walk_terms<'a>(term: &'a Term, visit: &mut dyn FnMut(&'a Term)) {
    visit(term);
    for kid in term.kids() {
        walk_terms(kid, visit);
    }
    if let tr::term::TermKind::Segment { dependents, .. } = &term.kind {
        for dependent in dependents {
            walk_terms(dependent, visit);
        }
    }
}

#[test]
fn bind_reports_unknown_names() {
    let catalog = school_catalog();
    let error = tr::bind::bind(&ident("shcool").collect(), &catalog).unwrap_err();
    let error = error.downcast::<Error>().unwrap();
    assert_eq!(error.reason.message(), "table `shcool` not found");

    let error = tr::bind::bind(
        &ident("school").select(vec![ident("oce")]).collect(),
        &catalog,
    )
    .unwrap_err();
    let error = error.downcast::<Error>().unwrap();
    assert_eq!(error.reason.message(), "attribute `oce` not found");
}

#[test]
fn bind_reports_bad_arity_and_type_mismatch() {
    let catalog = school_catalog();
    let error = tr::bind::bind(
        &ident("school")
            .select(vec![apply("count", vec![ident("department"), ident("program")])])
            .collect(),
        &catalog,
    )
    .unwrap_err();
    assert!(error.to_string().contains("expected 1 argument"));

    let error = tr::bind::bind(
        &ident("school")
            .sieve(operator("+", vec![ident("code"), operator("=", vec![
                ident("name"),
                text_literal("x"),
            ])]))
            .collect(),
        &catalog,
    )
    .unwrap_err();
    assert!(error.to_string().contains("cannot coerce"));
}

#[test]
fn encode_rejects_singular_aggregates() {
    let catalog = school_catalog();
    // `count(code)` aggregates a singular operand.
    let query = ident("school")
        .select(vec![apply("count", vec![ident("code")])])
        .collect();
    let binding = tr::bind::bind(&query, &catalog).unwrap();
    let flow = tr::route::route(&binding).unwrap();
    let error = tr::encode::encode(&flow, &catalog).unwrap_err();
    assert!(error.to_string().contains("expected a plural operand"));
}

#[test]
fn encode_rejects_plural_output_without_collect() {
    let catalog = school_catalog();
    // A bare plural selection is not a valid top-level value.
    let query = ident("school").select(vec![ident("code")]);
    let binding = tr::bind::bind(&query, &catalog).unwrap();
    let flow = tr::route::route(&binding).unwrap();
    let error = tr::encode::encode(&flow, &catalog).unwrap_err();
    assert!(error.to_string().contains("expected a singular expression"));
}

#[test]
fn rewrite_is_idempotent() {
    let catalog = school_catalog();
    let queries = vec![
        ident("school").collect(),
        ident("school")
            .select(vec![
                ident("code"),
                apply("count", vec![ident("department")]),
            ])
            .collect(),
        ident("school")
            .sieve(operator(">", vec![
                apply("count", vec![ident("department")]),
                integer_literal(3),
            ]))
            .select(vec![ident("code")])
            .collect(),
        ident("department")
            .quotient(vec![ident("school")])
            .select(vec![
                ident("school"),
                apply("count", vec![crate::syntax::complement()]),
            ])
            .collect(),
        ident("school")
            .sieve(operator("~", vec![ident("name"), text_literal("art")]))
            .collect(),
    ];
    for query in queries {
        let segment = encoded(&query, &catalog);
        let once = tr::rewrite::rewrite(&segment, &catalog).unwrap();
        let twice = tr::rewrite::rewrite(&once, &catalog).unwrap();
        assert_eq!(once.as_ref(), twice.as_ref(), "rewriting {query} twice diverged");
    }
}

#[test]
fn rewrite_raises_on_constant_kernels() {
    let catalog = school_catalog();
    let query = ident("department")
        .quotient(vec![text_literal("x")])
        .select(vec![apply("count", vec![crate::syntax::complement()])])
        .collect();
    let segment = encoded(&query, &catalog);
    let error = tr::rewrite::rewrite(&segment, &catalog).unwrap_err();
    assert!(error
        .to_string()
        .contains("found an empty or constant kernel"));
}

#[test]
fn rewrite_lowers_string_search_to_like() {
    let catalog = school_catalog();
    let query = ident("school")
        .sieve(operator("~", vec![ident("name"), text_literal("art_s")]))
        .collect();
    let segment = encoded(&query, &catalog);
    let segment = tr::rewrite::rewrite(&segment, &catalog).unwrap();
    // The search pattern folds into an escaped LIKE pattern.
    let rendered = format!("{:?}", segment);
    assert!(rendered.contains("Like"));
    assert!(rendered.contains("%art\\\\_s%"));
}

#[test]
fn compiled_terms_have_unique_tags_and_closed_offsprings() {
    let catalog = school_catalog();
    let queries = vec![
        ident("school")
            .select(vec![
                ident("code"),
                apply("count", vec![ident("department")]),
            ])
            .collect(),
        ident("school")
            .select(vec![
                ident("code"),
                ident("department").select(vec![ident("code")]).collect(),
            ])
            .collect(),
        ident("department")
            .quotient(vec![ident("school")])
            .select(vec![
                ident("school"),
                apply("count", vec![crate::syntax::complement()]),
            ])
            .collect(),
    ];
    for query in queries {
        let term = compiled(&query, &catalog);
        let mut tags: Vec<Tag> = Vec::new();
        walk_terms(&term, &mut |term| tags.push(term.tag));
        let unique: HashSet<Tag> = tags.iter().copied().collect();
        assert_eq!(tags.len(), unique.len(), "duplicate tags in {query}");

        // `offsprings` maps every transitive descendant to a direct kid.
        walk_terms(&term, &mut |term| {
            let kid_tags: HashSet<Tag> = term.kids().iter().map(|kid| kid.tag).collect();
            for (descendant, kid) in &term.offsprings {
                assert!(kid_tags.contains(kid));
                let kid_term = term
                    .kids()
                    .into_iter()
                    .find(|kid_term| kid_term.tag == *kid)
                    .unwrap();
                assert!(
                    kid_term.tag == *descendant || kid_term.offsprings.contains_key(descendant)
                );
            }
        });
    }
}

#[test]
fn routes_are_evaluable_and_baselines_inflated() {
    let catalog = school_catalog();
    let query = ident("school")
        .select(vec![
            ident("code"),
            apply("count", vec![ident("department")]),
        ])
        .collect();
    let term = compiled(&query, &catalog);
    walk_terms(&term, &mut |term| {
        assert!(term.baseline.is_inflated);
        assert!(term.space.concludes(&term.baseline));
        for unit in term.routes.keys() {
            assert!(
                term.space.spans(unit.space()),
                "route key not evaluable under the term space"
            );
        }
    });
}

#[test]
fn rewrite_preserves_spanning() {
    let catalog = school_catalog();
    let query = ident("school")
        .select(vec![
            ident("code"),
            apply("count", vec![ident("department")]),
        ])
        .collect();
    let segment = encoded(&query, &catalog);
    let spans_before: Vec<bool> = segment
        .codes
        .iter()
        .flat_map(|code| code.units())
        .map(|unit| segment.space.spans(unit.space()))
        .collect();
    let rewritten = tr::rewrite::rewrite(&segment, &catalog).unwrap();
    let spans_after: Vec<bool> = rewritten
        .codes
        .iter()
        .flat_map(|code| code.units())
        .map(|unit| rewritten.space.spans(unit.space()))
        .collect();
    assert!(spans_before.iter().all(|spans| *spans));
    assert!(spans_after.iter().all(|spans| *spans));
}

#[test]
fn stitch_connects_fiber_tables_by_the_foreign_key() {
    use crate::tr::space::{Code, Space, Unit};
    let catalog = school_catalog();
    let school = catalog.table_by_name("school").unwrap();
    let schools = Space::direct_table(Space::scalar(Space::root()), school);
    let join = catalog.reverse_joins(school).remove(0);
    let departments = Space::fiber_table(schools.clone(), join);

    let joints = tr::stitch::tie(&catalog, &departments).unwrap();
    assert_eq!(joints.len(), 1);
    let Code::Unit(Unit::Column { column: lcolumn, .. }) = &*joints[0].lop else {
        panic!("expected a column joint");
    };
    let Code::Unit(Unit::Column { column: rcolumn, .. }) = &*joints[0].rop else {
        panic!("expected a column joint");
    };
    assert_eq!(catalog.column(*lcolumn).name, "code");
    assert_eq!(catalog.column(*rcolumn).name, "school_code");
}

#[test]
fn stitch_requires_a_connecting_key() {
    use crate::tr::space::Space;
    let mut catalog = school_catalog();
    let log = catalog.add_table("log");
    catalog.add_column(log, "message", Domain::text(), true);
    let logs = Space::direct_table(Space::scalar(Space::root()), log);
    let error = tr::stitch::sew(&catalog, &logs).unwrap_err();
    assert!(error
        .to_string()
        .contains("unable to connect a table lacking a primary key"));
}

#[test]
fn weak_ordering_falls_back_from_the_primary_key() {
    use crate::tr::space::{Code, Space, Unit};
    let catalog = school_catalog();
    let school = catalog.table_by_name("school").unwrap();
    let schools = Space::direct_table(Space::scalar(Space::root()), school);
    let order = tr::stitch::arrange(&catalog, &schools, true, true);
    assert_eq!(order.len(), 1);
    let Code::Unit(Unit::Column { column, .. }) = &*order[0].0 else {
        panic!("expected a column order");
    };
    assert_eq!(catalog.column(*column).name, "code");
}
