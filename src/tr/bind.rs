//! Syntax → Binding.
//!
//! Resolves names against the catalog and applies the function library.
//! At the root scope an identifier names a table; at a table scope it
//! names a column, a direct link (a foreign key of the table) or a
//! reverse link (a foreign key into the table); at a quotient scope it
//! names a kernel field.  Implicit casts are inserted through the
//! coerce adapters; bad names, wrong arities and incompatible domains
//! are reported with the span of the offending syntax.

use std::collections::HashMap;
use std::rc::Rc;

use crate::catalog::{Catalog, ColumnRef, TableRef};
use crate::domain::{Domain, Value};
use crate::error::{guard, Error, Result};
use crate::syntax::{Syntax, SyntaxKind};
use crate::tr::coerce::{coerce, coerce_unary};
use crate::tr::signature::{AggregateOp, Polarity, Relation, Signature};
use crate::tr::binding::{Binding, BindingKind};

#[derive(Clone)]
struct Scope {
    binding: Rc<Binding>,
    kind: ScopeKind,
}

#[derive(Clone)]
enum ScopeKind {
    Root,
    Table(TableRef),
    Quotient(Vec<QuotientName>),
    Opaque,
}

/// A name visible inside a quotient scope, mapped to kernel positions.
#[derive(Clone)]
struct QuotientName {
    name: String,
    indices: Vec<usize>,
    domains: Vec<Domain>,
    is_identity: bool,
}

pub struct BindingState<'a> {
    catalog: &'a Catalog,
    scope: Scope,
    scope_stack: Vec<Scope>,
    quotient_names: HashMap<*const Binding, Vec<QuotientName>>,
}

impl<'a> BindingState<'a> {
    pub fn new(catalog: &'a Catalog) -> BindingState<'a> {
        let root = Binding::new(BindingKind::Root, Domain::Void);
        BindingState {
            catalog,
            scope: Scope {
                binding: root,
                kind: ScopeKind::Root,
            },
            scope_stack: Vec::new(),
            quotient_names: HashMap::new(),
        }
    }

    fn push_scope(&mut self, binding: &Rc<Binding>) {
        let kind = self.scope_kind_of(binding);
        self.scope_stack.push(std::mem::replace(
            &mut self.scope,
            Scope {
                binding: binding.clone(),
                kind,
            },
        ));
    }

    fn pop_scope(&mut self) {
        self.scope = self.scope_stack.pop().expect("unbalanced scope stack");
    }

    fn scope_kind_of(&self, binding: &Rc<Binding>) -> ScopeKind {
        match &binding.kind {
            BindingKind::Root | BindingKind::Home { .. } => ScopeKind::Root,
            BindingKind::Table { table, .. } => ScopeKind::Table(*table),
            BindingKind::Chain { joins, .. } => {
                ScopeKind::Table(joins.last().expect("a chain has joins").target)
            }
            BindingKind::Quotient { .. } => {
                match self.quotient_names.get(&Rc::as_ptr(binding)) {
                    Some(names) => ScopeKind::Quotient(names.clone()),
                    None => ScopeKind::Opaque,
                }
            }
            BindingKind::Complement { quotient, .. } => match &quotient.kind {
                BindingKind::Quotient { seed, .. } => self.scope_kind_of(seed),
                _ => ScopeKind::Opaque,
            },
            BindingKind::Cover { seed, .. }
            | BindingKind::Attach { seed, .. }
            | BindingKind::Locate { seed, .. }
            | BindingKind::Clip { seed, .. } => self.scope_kind_of(seed),
            BindingKind::Sieve { base, .. }
            | BindingKind::Sort { base, .. }
            | BindingKind::Fork { base, .. }
            | BindingKind::Selection { base, .. }
            | BindingKind::Decorate { base, .. } => self.scope_kind_of(base),
            _ => ScopeKind::Opaque,
        }
    }

    pub fn bind(&mut self, syntax: &Syntax) -> Result<Rc<Binding>> {
        guard(syntax.span, || self.bind_unguarded(syntax))
    }

    fn bind_unguarded(&mut self, syntax: &Syntax) -> Result<Rc<Binding>> {
        match &syntax.kind {
            SyntaxKind::Identifier(name) => self.lookup(name, syntax),
            SyntaxKind::Literal { text, kind } => Ok(self.bind_literal(text, *kind, syntax)),
            SyntaxKind::Apply { name, arguments } | SyntaxKind::Operator { name, arguments } => {
                self.bind_apply(name, arguments, syntax)
            }
            SyntaxKind::Compose { larm, rarm } => {
                let larm = self.bind(larm)?;
                self.push_scope(&larm);
                let result = self.bind(rarm);
                self.pop_scope();
                result
            }
            SyntaxKind::Select { arm, fields } => self.bind_select(arm, fields, syntax),
            SyntaxKind::Sieve { arm, filter } => {
                let arm = self.bind(arm)?;
                self.push_scope(&arm);
                let filter = self.bind(filter).and_then(|f| self.to_boolean(f));
                self.pop_scope();
                let domain = arm.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Sieve { base: arm, filter: filter? },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            SyntaxKind::Quotient { arm, kernels } => self.bind_quotient(arm, kernels, syntax),
            SyntaxKind::Complement => {
                let ScopeKind::Quotient(_) = &self.scope.kind else {
                    return Err(Error::simple(
                        "the complement is only defined in a quotient scope",
                    )
                    .into());
                };
                // The scope may wrap the quotient in filters or sorts;
                // find the quotient node itself for the seed domain.
                let base = self.scope.binding.clone();
                let mut quotient = base.clone();
                loop {
                    if matches!(quotient.kind, BindingKind::Quotient { .. }) {
                        break;
                    }
                    match quotient.base().cloned() {
                        Some(next) => quotient = next,
                        None => {
                            return Err(Error::simple(
                                "the complement is only defined in a quotient scope",
                            )
                            .into())
                        }
                    }
                }
                let BindingKind::Quotient { seed, .. } = &quotient.kind else {
                    unreachable!();
                };
                let domain = seed.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Complement {
                        base,
                        quotient: quotient.clone(),
                    },
                    domain,
                    syntax.span,
                    Some("^".to_owned()),
                ))
            }
            SyntaxKind::Collect { arm } => {
                let base = self.scope.binding.clone();
                let seed = self.bind(arm)?;
                let seed = self.wrap_entity_selection(seed)?;
                let domain = Domain::List(Box::new(seed.domain.clone()));
                Ok(Binding::with_syntax(
                    BindingKind::Collect { base, seed },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            SyntaxKind::Locate { arm, values } => self.bind_locate(arm, values, syntax),
            SyntaxKind::Direction { arm, direction } => {
                let base = self.bind(arm)?;
                let domain = base.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Decorate {
                        base,
                        direction: *direction,
                    },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
        }
    }

    fn lookup(&mut self, name: &str, syntax: &Syntax) -> Result<Rc<Binding>> {
        let scope_binding = self.scope.binding.clone();
        match &self.scope.kind {
            ScopeKind::Root => {
                let Some(table) = self.catalog.table_by_name(name) else {
                    return Err(Error::not_found(name, "table").into());
                };
                let home = Binding::new(
                    BindingKind::Home {
                        base: scope_binding,
                    },
                    Domain::Void,
                );
                Ok(Binding::with_syntax(
                    BindingKind::Table { base: home, table },
                    Domain::Entity(table),
                    syntax.span,
                    Some(name.to_owned()),
                ))
            }
            ScopeKind::Table(table) => {
                let table = *table;
                if let Some(column) = self.catalog.column_by_name(table, name) {
                    // A column that carries a whole foreign key doubles
                    // as a link.
                    let link = self
                        .catalog
                        .direct_joins(table)
                        .into_iter()
                        .find(|join| join.origin_columns == vec![column])
                        .map(|join| {
                            Binding::new(
                                BindingKind::Chain {
                                    base: scope_binding.clone(),
                                    joins: vec![join.clone()],
                                },
                                Domain::Entity(join.target),
                            )
                        });
                    let domain = self.catalog.column(column).domain.clone();
                    return Ok(Binding::with_syntax(
                        BindingKind::Column {
                            base: scope_binding,
                            column,
                            link,
                        },
                        domain,
                        syntax.span,
                        Some(name.to_owned()),
                    ));
                }
                if let Some(join) = self
                    .catalog
                    .direct_joins(table)
                    .into_iter()
                    .find(|join| self.catalog.table(join.target).name == name)
                {
                    let domain = Domain::Entity(join.target);
                    return Ok(Binding::with_syntax(
                        BindingKind::Chain {
                            base: scope_binding,
                            joins: vec![join],
                        },
                        domain,
                        syntax.span,
                        Some(name.to_owned()),
                    ));
                }
                if let Some(join) = self
                    .catalog
                    .reverse_joins(table)
                    .into_iter()
                    .find(|join| self.catalog.table(join.target).name == name)
                {
                    let domain = Domain::Entity(join.target);
                    return Ok(Binding::with_syntax(
                        BindingKind::Chain {
                            base: scope_binding,
                            joins: vec![join],
                        },
                        domain,
                        syntax.span,
                        Some(name.to_owned()),
                    ));
                }
                Err(Error::not_found(name, "attribute").into())
            }
            ScopeKind::Quotient(names) => {
                let Some(entry) = names.iter().find(|entry| entry.name == name).cloned() else {
                    return Err(Error::not_found(name, "kernel field").into());
                };
                let quotient = scope_binding.clone();
                let elements: Vec<Rc<Binding>> = entry
                    .indices
                    .iter()
                    .zip(entry.domains.iter())
                    .map(|(index, domain)| {
                        Binding::with_syntax(
                            BindingKind::Kernel {
                                base: scope_binding.clone(),
                                quotient: quotient.clone(),
                                index: *index,
                            },
                            domain.clone(),
                            syntax.span,
                            Some(name.to_owned()),
                        )
                    })
                    .collect();
                if entry.is_identity {
                    let domain = Domain::Identity(entry.domains.clone());
                    Ok(Binding::with_syntax(
                        BindingKind::Identity {
                            base: scope_binding,
                            elements,
                        },
                        domain,
                        syntax.span,
                        Some(name.to_owned()),
                    ))
                } else {
                    Ok(elements.into_iter().next().expect("a scalar kernel name"))
                }
            }
            ScopeKind::Opaque => Err(Error::not_found(name, "attribute").into()),
        }
    }

    fn bind_literal(&self, text: &str, kind: crate::syntax::LiteralKind, syntax: &Syntax) -> Rc<Binding> {
        use crate::syntax::LiteralKind;
        let (value, domain) = match kind {
            LiteralKind::Text => (Value::Text(text.to_owned()), Domain::Untyped),
            LiteralKind::Integer => (
                Value::Integer(text.parse().unwrap_or(0)),
                Domain::Integer,
            ),
            LiteralKind::Decimal => (Value::Decimal(text.to_owned()), Domain::decimal()),
            LiteralKind::Float => (Value::Float(text.parse().unwrap_or(0.0)), Domain::Float),
        };
        Binding::with_syntax(
            BindingKind::Literal {
                base: self.scope.binding.clone(),
                value,
            },
            domain,
            syntax.span,
            Some(syntax.to_string()),
        )
    }

    fn bind_select(
        &mut self,
        arm: &Syntax,
        fields: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Rc<Binding>> {
        let arm_binding = self.bind(arm)?;
        self.push_scope(&arm_binding);
        let result: Result<(Vec<Rc<Binding>>, Vec<crate::domain::Profile>)> = (|| {
            let mut elements = Vec::new();
            let mut profiles = Vec::new();
            for field in fields {
                let binding = self.bind(field)?;
                let binding = self.wrap_entity_identity(binding)?;
                let mut profile = crate::domain::Profile::new(binding.domain.clone());
                if let Some(name) = field.field_name() {
                    profile = profile.with_tag(name);
                }
                profile.syntax = Some(field.to_string());
                profile.path = path_of(&binding, self.catalog);
                profiles.push(profile);
                elements.push(binding);
            }
            Ok((elements, profiles))
        })();
        self.pop_scope();
        let (elements, profiles) = result?;
        Ok(Binding::with_syntax(
            BindingKind::Selection {
                base: arm_binding,
                elements,
            },
            Domain::Record(profiles),
            syntax.span,
            Some(syntax.to_string()),
        ))
    }

    fn bind_quotient(
        &mut self,
        arm: &Syntax,
        kernels: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Rc<Binding>> {
        let base = self.scope.binding.clone();
        let seed = self.bind(arm)?;
        self.push_scope(&seed);
        let result: Result<(Vec<Rc<Binding>>, Vec<QuotientName>)> = (|| {
            let mut bound: Vec<Rc<Binding>> = Vec::new();
            let mut names: Vec<QuotientName> = Vec::new();
            for kernel in kernels {
                let binding = self.bind(kernel)?;
                match &binding.domain {
                    Domain::Entity(table) => {
                        // An entity kernel expands into its identity
                        // columns.
                        let table = *table;
                        let columns = self.identity_columns(table);
                        let start = bound.len();
                        let mut domains = Vec::new();
                        for column in columns {
                            let domain = self.catalog.column(column).domain.clone();
                            domains.push(domain.clone());
                            bound.push(Binding::with_syntax(
                                BindingKind::Column {
                                    base: binding.clone(),
                                    column,
                                    link: None,
                                },
                                domain,
                                kernel.span,
                                Some(kernel.to_string()),
                            ));
                        }
                        if let Some(name) = kernel.field_name() {
                            names.push(QuotientName {
                                name: name.to_owned(),
                                indices: (start..bound.len()).collect(),
                                domains,
                                is_identity: true,
                            });
                        }
                    }
                    domain => {
                        let Some(specialized) = coerce_unary(domain) else {
                            return Err(Error::simple(format!(
                                "expected a scalar kernel, found {domain}"
                            ))
                            .into());
                        };
                        let binding = self.cast(binding, specialized.clone());
                        if let Some(name) = kernel.field_name() {
                            names.push(QuotientName {
                                name: name.to_owned(),
                                indices: vec![bound.len()],
                                domains: vec![specialized],
                                is_identity: false,
                            });
                        }
                        bound.push(binding);
                    }
                }
            }
            Ok((bound, names))
        })();
        self.pop_scope();
        let (kernels, names) = result?;
        let binding = Binding::with_syntax(
            BindingKind::Quotient {
                base,
                seed,
                kernels,
            },
            Domain::Opaque,
            syntax.span,
            Some(syntax.to_string()),
        );
        self.quotient_names.insert(Rc::as_ptr(&binding), names);
        Ok(binding)
    }

    fn bind_locate(
        &mut self,
        arm: &Syntax,
        values: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Rc<Binding>> {
        let base = self.scope.binding.clone();
        let seed = self.bind(arm)?;
        let Domain::Entity(table) = &seed.domain else {
            return Err(Error::simple("expected a row lookup on a table").into());
        };
        let table = *table;
        let columns = self.identity_columns(table);
        if columns.len() != values.len() {
            return Err(Error::simple(format!(
                "expected {} identity values, found {}",
                columns.len(),
                values.len()
            ))
            .into());
        }
        let mut images = Vec::new();
        for (column, value) in columns.into_iter().zip(values.iter()) {
            let lop = self.bind(value)?;
            let domain = self.catalog.column(column).domain.clone();
            let lop = self.cast(lop, domain.clone());
            let rop = Binding::with_syntax(
                BindingKind::Column {
                    base: seed.clone(),
                    column,
                    link: None,
                },
                domain,
                syntax.span,
                None,
            );
            images.push((lop, rop));
        }
        Ok(Binding::with_syntax(
            BindingKind::Locate {
                base,
                seed: seed.clone(),
                images,
                condition: None,
            },
            seed.domain.clone(),
            syntax.span,
            Some(syntax.to_string()),
        ))
    }

    fn bind_apply(
        &mut self,
        name: &str,
        arguments: &[Syntax],
        syntax: &Syntax,
    ) -> Result<Rc<Binding>> {
        let arity = |expected: usize| -> Result<()> {
            if arguments.len() != expected {
                return Err(Error::simple(format!(
                    "expected {} argument(s), found {}",
                    expected,
                    arguments.len()
                ))
                .into());
            }
            Ok(())
        };
        match name {
            "=" | "!=" => {
                arity(2)?;
                let polarity = if name == "=" {
                    Polarity::Positive
                } else {
                    Polarity::Negative
                };
                let (lop, rop) = self.bind_coerced_pair(&arguments[0], &arguments[1])?;
                Ok(self.formula(
                    Signature::IsEqual { polarity },
                    Domain::Boolean,
                    vec![lop, rop],
                    syntax,
                ))
            }
            "==" | "!==" => {
                arity(2)?;
                let polarity = if name == "==" {
                    Polarity::Positive
                } else {
                    Polarity::Negative
                };
                let (lop, rop) = self.bind_coerced_pair(&arguments[0], &arguments[1])?;
                Ok(self.formula(
                    Signature::IsTotallyEqual { polarity },
                    Domain::Boolean,
                    vec![lop, rop],
                    syntax,
                ))
            }
            "<" | "<=" | ">" | ">=" => {
                arity(2)?;
                let relation = match name {
                    "<" => Relation::Lt,
                    "<=" => Relation::Le,
                    ">" => Relation::Gt,
                    _ => Relation::Ge,
                };
                let (lop, rop) = self.bind_coerced_pair(&arguments[0], &arguments[1])?;
                Ok(self.formula(
                    Signature::Compare { relation },
                    Domain::Boolean,
                    vec![lop, rop],
                    syntax,
                ))
            }
            "&" | "|" => {
                if arguments.len() < 2 {
                    return Err(Error::simple("expected at least 2 arguments").into());
                }
                let mut ops = Vec::new();
                for argument in arguments {
                    let op = self.bind(argument)?;
                    ops.push(self.to_boolean(op)?);
                }
                let signature = if name == "&" {
                    Signature::And
                } else {
                    Signature::Or
                };
                Ok(self.formula(signature, Domain::Boolean, ops, syntax))
            }
            "!" | "not" => {
                arity(1)?;
                let op = self.bind(&arguments[0])?;
                let op = self.to_boolean(op)?;
                Ok(self.formula(Signature::Not, Domain::Boolean, vec![op], syntax))
            }
            "+" | "-" | "*" | "/" => {
                if name == "-" && arguments.len() == 1 {
                    let op = self.bind(&arguments[0])?;
                    let domain = op.domain.clone();
                    return Ok(self.formula(Signature::Negate, domain, vec![op], syntax));
                }
                arity(2)?;
                let (lop, rop) = self.bind_coerced_pair(&arguments[0], &arguments[1])?;
                let domain = lop.domain.clone();
                if matches!(domain, Domain::Text { .. }) && name == "+" {
                    return Ok(self.formula(
                        Signature::Concatenate,
                        domain,
                        vec![lop, rop],
                        syntax,
                    ));
                }
                if !matches!(
                    domain,
                    Domain::Integer | Domain::Decimal { .. } | Domain::Float
                ) {
                    return Err(Error::simple(format!(
                        "cannot apply {name} to values of type {domain}"
                    ))
                    .into());
                }
                let signature = match name {
                    "+" => Signature::Add,
                    "-" => Signature::Subtract,
                    "*" => Signature::Multiply,
                    _ => Signature::Divide,
                };
                Ok(self.formula(signature, domain, vec![lop, rop], syntax))
            }
            "~" | "contains" => {
                arity(2)?;
                let lop = self.bind(&arguments[0])?;
                let lop = self.cast(lop, Domain::text());
                let rop = self.bind(&arguments[1])?;
                let rop = self.cast(rop, Domain::text());
                Ok(self.formula(
                    Signature::Contains {
                        polarity: Polarity::Positive,
                    },
                    Domain::Boolean,
                    vec![lop, rop],
                    syntax,
                ))
            }
            "count" => {
                arity(1)?;
                let op = self.bind(&arguments[0])?;
                let op = self.to_boolean(op)?;
                Ok(self.formula(
                    Signature::Aggregate {
                        op: AggregateOp::Count,
                    },
                    Domain::Integer,
                    vec![op],
                    syntax,
                ))
            }
            "exists" | "any" | "every" => {
                arity(1)?;
                let polarity = if name == "every" {
                    Polarity::Negative
                } else {
                    Polarity::Positive
                };
                let op = self.bind(&arguments[0])?;
                let op = self.to_boolean(op)?;
                Ok(self.formula(
                    Signature::Quantify { polarity },
                    Domain::Boolean,
                    vec![op],
                    syntax,
                ))
            }
            "sum" | "min" | "max" => {
                arity(1)?;
                let op = self.bind(&arguments[0])?;
                let Some(domain) = coerce_unary(&op.domain) else {
                    return Err(Error::simple(format!(
                        "cannot apply {name} to a value of type {}",
                        op.domain
                    ))
                    .into());
                };
                if name == "sum"
                    && !matches!(
                        domain,
                        Domain::Integer | Domain::Decimal { .. } | Domain::Float
                    )
                {
                    return Err(Error::simple(format!(
                        "cannot apply sum to a value of type {domain}"
                    ))
                    .into());
                }
                let op = self.cast(op, domain.clone());
                let aggregate = match name {
                    "sum" => AggregateOp::Sum,
                    "min" => AggregateOp::Min,
                    _ => AggregateOp::Max,
                };
                Ok(self.formula(
                    Signature::Aggregate { op: aggregate },
                    domain,
                    vec![op],
                    syntax,
                ))
            }
            "filter" => {
                arity(1)?;
                let base = self.scope.binding.clone();
                let filter = self.bind(&arguments[0])?;
                let filter = self.to_boolean(filter)?;
                let domain = base.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Sieve { base, filter },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            "sort" => {
                if arguments.is_empty() {
                    return Err(Error::simple("expected at least 1 argument").into());
                }
                let base = self.scope.binding.clone();
                let order = arguments
                    .iter()
                    .map(|argument| self.bind(argument))
                    .collect::<Result<Vec<_>>>()?;
                let domain = base.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Sort {
                        base,
                        order,
                        limit: None,
                        offset: None,
                    },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            "limit" => {
                if arguments.is_empty() || arguments.len() > 2 {
                    return Err(Error::simple("expected 1 or 2 arguments").into());
                }
                let limit = Some(integer_argument(&arguments[0])?);
                let offset = arguments.get(1).map(integer_argument).transpose()?;
                let base = self.scope.binding.clone();
                let domain = base.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Sort {
                        base,
                        order: Vec::new(),
                        limit,
                        offset,
                    },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            "top" => {
                if arguments.is_empty() || arguments.len() > 3 {
                    return Err(Error::simple("expected 1 to 3 arguments").into());
                }
                let base = self.scope.binding.clone();
                let seed = self.bind(&arguments[0])?;
                let limit = arguments
                    .get(1)
                    .map(integer_argument)
                    .transpose()?
                    .or(Some(1));
                let offset = arguments.get(2).map(integer_argument).transpose()?;
                let domain = seed.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Clip {
                        base,
                        seed,
                        order: Vec::new(),
                        limit,
                        offset,
                    },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            "fork" => {
                let base = self.scope.binding.clone();
                let kernels = arguments
                    .iter()
                    .map(|argument| self.bind(argument))
                    .collect::<Result<Vec<_>>>()?;
                let domain = base.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Fork { base, kernels },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            "attach" => {
                if arguments.is_empty() || arguments.len() % 2 == 0 {
                    return Err(
                        Error::simple("expected a seed and pairs of linking expressions").into()
                    );
                }
                let base = self.scope.binding.clone();
                let seed = self.bind(&arguments[0])?;
                let mut images = Vec::new();
                for pair in arguments[1..].chunks(2) {
                    let lop = self.bind(&pair[0])?;
                    self.push_scope(&seed);
                    let rop = self.bind(&pair[1]);
                    self.pop_scope();
                    images.push((lop, rop?));
                }
                let domain = seed.domain.clone();
                Ok(Binding::with_syntax(
                    BindingKind::Attach {
                        base,
                        seed,
                        images,
                        condition: None,
                    },
                    domain,
                    syntax.span,
                    Some(syntax.to_string()),
                ))
            }
            "is_null" => {
                arity(1)?;
                let op = self.bind(&arguments[0])?;
                Ok(self.formula(
                    Signature::IsNull {
                        polarity: Polarity::Positive,
                    },
                    Domain::Boolean,
                    vec![op],
                    syntax,
                ))
            }
            "if_null" | "null_if" => {
                arity(2)?;
                let (lop, rop) = self.bind_coerced_pair(&arguments[0], &arguments[1])?;
                let domain = lop.domain.clone();
                let signature = if name == "if_null" {
                    Signature::IfNull
                } else {
                    Signature::NullIf
                };
                Ok(self.formula(signature, domain, vec![lop, rop], syntax))
            }
            "if" => {
                if arguments.len() < 2 {
                    return Err(Error::simple("expected at least 2 arguments").into());
                }
                let branches = arguments.len() / 2;
                let has_alternative = arguments.len() % 2 == 1;
                let mut predicates = Vec::new();
                let mut consequents = Vec::new();
                for pair in arguments[..branches * 2].chunks(2) {
                    let predicate = self.bind(&pair[0])?;
                    predicates.push(self.to_boolean(predicate)?);
                    consequents.push(self.bind(&pair[1])?);
                }
                let mut alternative = None;
                if has_alternative {
                    alternative = Some(self.bind(&arguments[arguments.len() - 1])?);
                }
                // All branches coerce to one common domain.
                let mut domains: Vec<Domain> =
                    consequents.iter().map(|c| c.domain.clone()).collect();
                if let Some(alternative) = &alternative {
                    domains.push(alternative.domain.clone());
                }
                let Some(domain) = coerce(&domains) else {
                    return Err(Error::simple("cannot coerce the branches of if").into());
                };
                let mut args = predicates;
                for consequent in consequents {
                    args.push(self.cast(consequent, domain.clone()));
                }
                if let Some(alternative) = alternative {
                    args.push(self.cast(alternative, domain.clone()));
                }
                Ok(self.formula(
                    Signature::If {
                        branches,
                        has_alternative,
                    },
                    domain,
                    args,
                    syntax,
                ))
            }
            "length" => {
                arity(1)?;
                let op = self.bind(&arguments[0])?;
                let op = self.cast(op, Domain::text());
                Ok(self.formula(Signature::Length, Domain::Integer, vec![op], syntax))
            }
            "head" | "tail" => {
                if arguments.is_empty() || arguments.len() > 2 {
                    return Err(Error::simple("expected 1 or 2 arguments").into());
                }
                let op = self.bind(&arguments[0])?;
                let op = self.cast(op, Domain::text());
                let mut args = vec![op];
                let has_length = arguments.len() == 2;
                if has_length {
                    let length = self.bind(&arguments[1])?;
                    args.push(self.cast(length, Domain::Integer));
                }
                let signature = if name == "head" {
                    Signature::Head { has_length }
                } else {
                    Signature::Tail { has_length }
                };
                Ok(self.formula(signature, Domain::text(), args, syntax))
            }
            "slice" => {
                if arguments.is_empty() || arguments.len() > 3 {
                    return Err(Error::simple("expected 1 to 3 arguments").into());
                }
                let op = self.bind(&arguments[0])?;
                let op = self.cast(op, Domain::text());
                let mut args = vec![op];
                for index in 1..3 {
                    match arguments.get(index) {
                        Some(argument) => {
                            let bound = self.bind(argument)?;
                            args.push(self.cast(bound, Domain::Integer));
                        }
                        None => args.push(Binding::new(
                            BindingKind::Literal {
                                base: self.scope.binding.clone(),
                                value: Value::Null,
                            },
                            Domain::Integer,
                        )),
                    }
                }
                Ok(self.formula(Signature::Slice, Domain::text(), args, syntax))
            }
            "at" => {
                if arguments.len() < 2 || arguments.len() > 3 {
                    return Err(Error::simple("expected 2 or 3 arguments").into());
                }
                let op = self.bind(&arguments[0])?;
                let op = self.cast(op, Domain::text());
                let index = self.bind(&arguments[1])?;
                let mut args = vec![op, self.cast(index, Domain::Integer)];
                let has_length = arguments.len() == 3;
                if has_length {
                    let length = self.bind(&arguments[2])?;
                    args.push(self.cast(length, Domain::Integer));
                }
                Ok(self.formula(
                    Signature::At { has_length },
                    Domain::text(),
                    args,
                    syntax,
                ))
            }
            "boolean" | "text" | "integer" | "decimal" | "float" | "date" | "time"
            | "datetime" => {
                arity(1)?;
                let domain = match name {
                    "boolean" => Domain::Boolean,
                    "text" => Domain::text(),
                    "integer" => Domain::Integer,
                    "decimal" => Domain::decimal(),
                    "float" => Domain::Float,
                    "date" => Domain::Date,
                    "time" => Domain::Time,
                    _ => Domain::DateTime,
                };
                let op = self.bind(&arguments[0])?;
                Ok(self.cast(op, domain))
            }
            _ => Err(Error::not_found(name, "function").into()),
        }
    }

    fn bind_coerced_pair(
        &mut self,
        left: &Syntax,
        right: &Syntax,
    ) -> Result<(Rc<Binding>, Rc<Binding>)> {
        let lop = self.bind(left)?;
        let rop = self.bind(right)?;
        let Some(domain) = coerce([&lop.domain, &rop.domain]) else {
            return Err(Error::simple(format!(
                "cannot coerce values of types {} and {}",
                lop.domain, rop.domain
            ))
            .into());
        };
        Ok((self.cast(lop, domain.clone()), self.cast(rop, domain)))
    }

    fn formula(
        &self,
        signature: Signature,
        domain: Domain,
        arguments: Vec<Rc<Binding>>,
        syntax: &Syntax,
    ) -> Rc<Binding> {
        Binding::with_syntax(
            BindingKind::Formula {
                base: self.scope.binding.clone(),
                signature,
                arguments,
            },
            domain,
            syntax.span,
            Some(syntax.to_string()),
        )
    }

    fn cast(&self, binding: Rc<Binding>, domain: Domain) -> Rc<Binding> {
        if binding.domain == domain {
            return binding;
        }
        let span = binding.span;
        let syntax = binding.syntax.clone();
        Binding::with_syntax(BindingKind::Cast { base: binding }, domain, span, syntax)
    }

    fn to_boolean(&self, binding: Rc<Binding>) -> Result<Rc<Binding>> {
        Ok(self.cast(binding, Domain::Boolean))
    }

    /// The columns identifying a row: the connecting key, or all columns
    /// when no key exists.
    fn identity_columns(&self, table: TableRef) -> Vec<ColumnRef> {
        self.catalog.connecting_columns(table).unwrap_or_else(|| {
            (0..self.catalog.table(table).columns.len())
                .map(|index| ColumnRef { table, index })
                .collect()
        })
    }

    /// A bare entity used as a segment seed selects all its columns.
    fn wrap_entity_selection(&mut self, binding: Rc<Binding>) -> Result<Rc<Binding>> {
        let Domain::Entity(table) = &binding.domain else {
            return Ok(binding);
        };
        let table = *table;
        let mut elements = Vec::new();
        let mut profiles = Vec::new();
        for (index, column) in self.catalog.table(table).columns.iter().enumerate() {
            let column_ref = ColumnRef { table, index };
            let element = Binding::with_syntax(
                BindingKind::Column {
                    base: binding.clone(),
                    column: column_ref,
                    link: None,
                },
                column.domain.clone(),
                binding.span,
                Some(column.name.clone()),
            );
            let mut profile = crate::domain::Profile::new(column.domain.clone());
            profile = profile.with_tag(&column.name);
            profile.path = path_of(&element, self.catalog);
            profiles.push(profile);
            elements.push(element);
        }
        let span = binding.span;
        let syntax = binding.syntax.clone();
        Ok(Binding::with_syntax(
            BindingKind::Selection {
                base: binding,
                elements,
            },
            Domain::Record(profiles),
            span,
            syntax,
        ))
    }

    /// A bare entity used as a selection field renders as its identity.
    fn wrap_entity_identity(&mut self, binding: Rc<Binding>) -> Result<Rc<Binding>> {
        let Domain::Entity(table) = &binding.domain else {
            return Ok(binding);
        };
        let table = *table;
        let columns = self.identity_columns(table);
        let mut elements = Vec::new();
        let mut domains = Vec::new();
        for column in columns {
            let domain = self.catalog.column(column).domain.clone();
            domains.push(domain.clone());
            elements.push(Binding::with_syntax(
                BindingKind::Column {
                    base: binding.clone(),
                    column,
                    link: None,
                },
                domain,
                binding.span,
                Some(self.catalog.column(column).name.clone()),
            ));
        }
        let span = binding.span;
        let syntax = binding.syntax.clone();
        Ok(Binding::with_syntax(
            BindingKind::Identity {
                base: binding,
                elements,
            },
            Domain::Identity(domains),
            span,
            syntax,
        ))
    }
}

fn integer_argument(syntax: &Syntax) -> Result<usize> {
    if let SyntaxKind::Literal { text, kind } = &syntax.kind {
        if matches!(kind, crate::syntax::LiteralKind::Integer) {
            if let Ok(value) = text.parse::<usize>() {
                return Ok(value);
            }
        }
    }
    Err(Error::simple("expected a non-negative integer literal").into())
}

/// Catalog labels navigated by the binding, for the output profile.
fn path_of(binding: &Rc<Binding>, catalog: &Catalog) -> Vec<String> {
    match &binding.kind {
        BindingKind::Column { base, column, .. } => {
            let mut path = path_of(base, catalog);
            path.push(catalog.column(*column).name.clone());
            path
        }
        BindingKind::Table { table, .. } => vec![catalog.table(*table).name.clone()],
        BindingKind::Chain { base, joins } => {
            let mut path = path_of(base, catalog);
            for join in joins {
                path.push(catalog.table(join.target).name.clone());
            }
            path
        }
        BindingKind::Sieve { base, .. }
        | BindingKind::Sort { base, .. }
        | BindingKind::Decorate { base, .. } => path_of(base, catalog),
        BindingKind::Identity { base, .. } => path_of(base, catalog),
        _ => Vec::new(),
    }
}

/// Resolves a syntax tree against the catalog.
pub fn bind(syntax: &Syntax, catalog: &Catalog) -> Result<Rc<Binding>> {
    log::debug!("binding {syntax}");
    BindingState::new(catalog).bind(syntax)
}
