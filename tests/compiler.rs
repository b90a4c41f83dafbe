//! End-to-end scenarios over the school schema: compile a query, check
//! the generated SQL shape, execute the plan against canned rows and
//! check the packed output.

use htsql_compiler::catalog::Catalog;
use htsql_compiler::cmd;
use htsql_compiler::domain::{Data, Domain, Value};
use htsql_compiler::syntax::{apply, complement, ident, integer_literal, operator, Syntax};
use htsql_compiler::{compile, produce, Database, Plan};

fn school_catalog() -> Catalog {
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

    let course = catalog.add_table("course");
    catalog.add_column(course, "department_code", Domain::text(), false);
    catalog.add_column(course, "no", Domain::Integer, false);
    catalog.add_column(course, "title", Domain::text(), false);
    catalog.add_column(course, "credits", Domain::Integer, true);
    catalog.add_primary_key(course, &["department_code", "no"]);
    catalog.add_foreign_key(course, &["department_code"], department, &["code"]);

    catalog
}

/// Returns canned row sets in the order the plan submits its
/// statements.
struct MockDatabase {
    results: std::collections::VecDeque<Vec<Vec<Value>>>,
    statements: Vec<String>,
}

impl MockDatabase {
    fn new(results: Vec<Vec<Vec<Value>>>) -> MockDatabase {
        MockDatabase {
            results: results.into_iter().collect(),
            statements: Vec::new(),
        }
    }
}

impl Database for MockDatabase {
    fn execute(
        &mut self,
        sql: &str,
        _input: Option<&[Data]>,
    ) -> htsql_compiler::Result<Vec<Vec<Value>>> {
        self.statements.push(sql.to_owned());
        Ok(self.results.pop_front().unwrap_or_default())
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_owned())
}

fn plan(syntax: &Syntax) -> Plan {
    let catalog = school_catalog();
    compile(syntax, &catalog).unwrap_or_else(|error| panic!("{error}"))
}

#[test]
fn scenario_all_rows_of_a_table() {
    // /school
    let plan = plan(&ident("school").collect());

    // A flat select of all columns, in primary-key order.
    insta::assert_snapshot!(
        plan.sql,
        @"SELECT school.code AS c1, school.name AS c2, school.campus AS c3 FROM school ORDER BY school.code ASC"
    );

    // The output is a list of records with one field per column, in
    // declaration order.
    let Domain::List(element) = &plan.meta.domain else {
        panic!("expected a list output");
    };
    let Domain::Record(fields) = element.as_ref() else {
        panic!("expected records");
    };
    let tags: Vec<&str> = fields
        .iter()
        .map(|field| field.tag.as_deref().unwrap())
        .collect();
    assert_eq!(tags, ["code", "name", "campus"]);

    let mut database = MockDatabase::new(vec![vec![
        vec![text("art"), text("School of Art"), Value::Null],
        vec![text("eng"), text("School of Engineering"), text("north")],
    ]]);
    let product = produce(&plan, &mut database).unwrap();
    let Data::List(rows) = &product.data else {
        panic!("expected a list");
    };
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0],
        Data::record(vec![
            Data::Value(text("art")),
            Data::Value(text("School of Art")),
            Data::Value(Value::Null),
        ])
    );
}

#[test]
fn scenario_aggregate_over_a_link() {
    // /school{code, count(department)}
    let plan = plan(
        &ident("school")
            .select(vec![
                ident("code"),
                apply("count", vec![ident("department")]),
            ])
            .collect(),
    );

    // The aggregate joins a projected subquery; schools without
    // departments survive the left join and count 0.
    assert!(plan.sql.contains("LEFT OUTER JOIN"));
    assert!(plan.sql.contains("GROUP BY"));
    assert!(plan.sql.contains("COALESCE"));
    assert!(plan.sql.contains("COUNT"));

    let mut database = MockDatabase::new(vec![vec![
        vec![text("art"), Value::Integer(2)],
        vec![text("eng"), Value::Integer(0)],
    ]]);
    let product = produce(&plan, &mut database).unwrap();
    assert_eq!(
        product.data,
        Data::list(vec![
            Data::record(vec![Data::Value(text("art")), Data::Value(Value::Integer(2))]),
            Data::record(vec![Data::Value(text("eng")), Data::Value(Value::Integer(0))]),
        ])
    );
}

#[test]
fn scenario_aggregate_in_a_filter() {
    // /school.filter(count(department)>3){code}
    let plan = plan(
        &ident("school")
            .compose(apply(
                "filter",
                vec![operator(
                    ">",
                    vec![
                        apply("count", vec![ident("department")]),
                        integer_literal(3),
                    ],
                )],
            ))
            .select(vec![ident("code")])
            .collect(),
    );

    // The aggregate lands in a WHERE condition over the projected join.
    assert!(plan.sql.contains("WHERE"));
    assert!(plan.sql.contains("GROUP BY"));
    assert!(plan.sql.contains("> 3"));

    let Domain::List(element) = &plan.meta.domain else {
        panic!("expected a list output");
    };
    let Domain::Record(fields) = element.as_ref() else {
        panic!("expected records");
    };
    assert_eq!(fields.len(), 1);
}

#[test]
fn scenario_quotient_with_embedded_aggregate() {
    // /department^school{school, count(^)}
    let plan = plan(
        &ident("department")
            .quotient(vec![ident("school")])
            .select(vec![ident("school"), apply("count", vec![complement()])])
            .collect(),
    );

    // One row per distinct school value present in department.
    assert!(plan.sql.contains("GROUP BY"));
    assert!(plan.sql.contains("COUNT"));
    // The kernel is the school identity reached through the link.
    assert!(plan.sql.contains("school_code"));

    let mut database = MockDatabase::new(vec![vec![
        vec![Value::Boolean(true), text("art"), Value::Integer(3)],
        vec![Value::Boolean(true), text("eng"), Value::Integer(5)],
    ]]);
    let product = produce(&plan, &mut database).unwrap();
    assert_eq!(
        product.data,
        Data::list(vec![
            Data::record(vec![
                Data::record(vec![Data::Value(text("art"))]),
                Data::Value(Value::Integer(3)),
            ]),
            Data::record(vec![
                Data::record(vec![Data::Value(text("eng"))]),
                Data::Value(Value::Integer(5)),
            ]),
        ])
    );
}

#[test]
fn scenario_nested_segments_merge_on_keys() {
    // /school{code, /department{code}}
    let plan = plan(
        &ident("school")
            .select(vec![
                ident("code"),
                ident("department")
                    .select(vec![ident("code")])
                    .collect(),
            ])
            .collect(),
    );

    let mut database = MockDatabase::new(vec![
        // Parent rows: school codes, ordered by the primary key.
        vec![vec![text("art")], vec![text("eng")]],
        // Child rows: department code + school code, ordered by the
        // school key then the department key.
        vec![
            vec![text("paint"), text("art")],
            vec![text("sculp"), text("art")],
            vec![text("mech"), text("eng")],
        ],
    ]);
    let product = produce(&plan, &mut database).unwrap();

    // Both statements ran.
    assert_eq!(database.statements.len(), 2);
    // The child statement orders by the school key for the merge.
    assert!(database.statements[1].contains("department"));

    similar_asserts::assert_eq!(
        product.data,
        Data::list(vec![
            Data::record(vec![
                Data::Value(text("art")),
                Data::list(vec![
                    Data::record(vec![Data::Value(text("paint"))]),
                    Data::record(vec![Data::Value(text("sculp"))]),
                ]),
            ]),
            Data::record(vec![
                Data::Value(text("eng")),
                Data::list(vec![Data::record(vec![Data::Value(text("mech"))])]),
            ]),
        ])
    );
}

#[test]
fn scenario_correlated_exists() {
    // /school?exists(department.course?credits>3)
    let plan = plan(
        &ident("school")
            .sieve(apply(
                "exists",
                vec![ident("department")
                    .compose(ident("course"))
                    .sieve(operator(
                        ">",
                        vec![ident("credits"), integer_literal(3)],
                    ))],
            ))
            .collect(),
    );

    assert!(plan.sql.contains("EXISTS(SELECT"));
    assert!(plan.sql.contains("credits"));
    assert!(plan.sql.contains("WHERE"));

    let mut database = MockDatabase::new(vec![vec![vec![
        text("eng"),
        text("School of Engineering"),
        Value::Null,
    ]]]);
    let product = produce(&plan, &mut database).unwrap();
    let Data::List(rows) = &product.data else {
        panic!("expected a list");
    };
    assert_eq!(rows.len(), 1);
}

#[test]
fn summon_sql_command_exposes_the_statement() {
    let catalog = school_catalog();
    let query = apply("sql", vec![ident("school").collect()]);
    let plan = htsql_compiler::act(&query, &catalog).unwrap();
    assert!(plan.sql.starts_with("SELECT "));

    let command = cmd::recognize(&query).unwrap();
    assert!(matches!(command, cmd::Command::Sql { .. }));
}

#[test]
fn errors_carry_source_context() {
    let catalog = school_catalog();
    let query = ident("shcool").collect();
    let error = compile(&query, &catalog).unwrap_err();
    assert!(error.to_string().contains("table `shcool` not found"));
}
