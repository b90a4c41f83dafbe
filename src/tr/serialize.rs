//! Frame → SQL.
//!
//! Renders each segment frame into one SQL statement and stitches the
//! segment tree into an executable rows pipe: a parent statement joined
//! with its dependent statements through a merge-join keyed on the
//! segment keys.
//!
//! Aliasing is deterministic: table frames take their table name (with
//! numeric suffixes on collision), nested frames take sequential `q`
//! names, and every `SELECT` item of a nested frame is labelled `cN` so
//! references resolve by position.

use std::collections::{HashMap, HashSet};
use std::fmt::Write;

use once_cell::sync::Lazy;

use crate::catalog::Catalog;
use crate::domain::{Domain, Value};
use crate::error::{Error, Result};
use crate::syntax::Direction;
use crate::tr::frame::{Anchor, Frame, FrameKind, NestedFrame, Phrase, PhraseKind, SegmentFrame};
use crate::tr::pipe::Pipe;
use crate::tr::signature::Signature;
use crate::tr::term::Tag;

static RESERVED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "all", "and", "any", "as", "asc", "between", "by", "case", "cast", "check", "collate",
        "column", "constraint", "create", "cross", "current", "default", "desc", "distinct",
        "else", "end", "except", "exists", "false", "for", "foreign", "from", "full", "group",
        "having", "in", "inner", "intersect", "into", "is", "join", "left", "like", "limit",
        "natural", "not", "null", "offset", "on", "or", "order", "outer", "primary", "references",
        "right", "select", "set", "some", "table", "then", "to", "true", "union", "unique",
        "user", "using", "values", "when", "where", "with",
    ]
    .into_iter()
    .collect()
});

/// Quotes an identifier when it is not a plain lowercase name.
fn quote_name(name: &str) -> String {
    let is_plain = !name.is_empty()
        && name.chars().next().unwrap().is_ascii_lowercase()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(name);
    if is_plain {
        name.to_owned()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

struct Serializer<'a> {
    catalog: &'a Catalog,
    aliases: HashMap<Tag, String>,
    used_aliases: HashSet<String>,
    next_subquery: usize,
    embedded: HashMap<Tag, String>,
}

impl<'a> Serializer<'a> {
    fn new(catalog: &'a Catalog) -> Serializer<'a> {
        Serializer {
            catalog,
            aliases: HashMap::new(),
            used_aliases: HashSet::new(),
            next_subquery: 1,
            embedded: HashMap::new(),
        }
    }

    fn allocate_alias(&mut self, tag: Tag, hint: Option<&str>) -> String {
        if let Some(alias) = self.aliases.get(&tag) {
            return alias.clone();
        }
        let base = match hint {
            Some(hint) => hint.to_owned(),
            None => {
                let name = format!("q{}", self.next_subquery);
                self.next_subquery += 1;
                name
            }
        };
        let mut alias = base.clone();
        let mut counter = 2;
        while self.used_aliases.contains(&alias) {
            alias = format!("{base}_{counter}");
            counter += 1;
        }
        self.used_aliases.insert(alias.clone());
        self.aliases.insert(tag, alias.clone());
        alias
    }

    fn alias(&self, tag: Tag) -> Result<&str> {
        self.aliases
            .get(&tag)
            .map(String::as_str)
            .ok_or_else(|| Error::simple("expected an exported frame").into())
    }

    /// Renders a frame for the `FROM` list, with its alias.
    fn dump_from_element(&mut self, frame: &Frame) -> Result<String> {
        match &frame.kind {
            FrameKind::Scalar => {
                let alias = self.allocate_alias(frame.tag, None);
                Ok(format!("(SELECT TRUE AS c1) AS {}", quote_name(&alias)))
            }
            FrameKind::Table(table) => {
                let entity = self.catalog.table(*table);
                let alias = self.allocate_alias(frame.tag, Some(&entity.name));
                let mut name = quote_name(&entity.name);
                if let Some(schema) = &entity.schema {
                    name = format!("{}.{}", quote_name(schema), name);
                }
                if alias == entity.name {
                    Ok(name)
                } else {
                    Ok(format!("{} AS {}", name, quote_name(&alias)))
                }
            }
            FrameKind::Nested(nested) => {
                let alias = self.allocate_alias(frame.tag, None);
                let sql = self.dump_nested(nested)?;
                Ok(format!("({}) AS {}", sql, quote_name(&alias)))
            }
            FrameKind::Segment(_) => {
                Err(Error::simple("a segment frame cannot be nested in a FROM list").into())
            }
        }
    }

    fn dump_nested(&mut self, frame: &NestedFrame) -> Result<String> {
        // A leading placeholder frame cross-joined with a real frame
        // exports nothing; promote the next frame to the front.
        let mut include: Vec<&Anchor> = frame.include.iter().collect();
        while include.len() > 1 && is_vacuous(&include[0].frame) && include[1].is_cross() {
            include.remove(0);
        }
        // The FROM list renders first so references in the SELECT list
        // can resolve the aliases.
        let mut from = String::new();
        for (position, anchor) in include.iter().enumerate() {
            let element = self.dump_from_element(&anchor.frame)?;
            if position == 0 {
                write!(from, " FROM {element}").unwrap();
            } else {
                let join = if anchor.is_left && anchor.is_right {
                    "FULL OUTER JOIN"
                } else if anchor.is_left {
                    "LEFT OUTER JOIN"
                } else if anchor.is_right {
                    "RIGHT OUTER JOIN"
                } else if anchor.is_cross() {
                    "CROSS JOIN"
                } else {
                    "INNER JOIN"
                };
                write!(from, " {join} {element}").unwrap();
                if let Some(condition) = &anchor.condition {
                    write!(from, " ON {}", self.dump_phrase(condition)?).unwrap();
                }
            }
        }

        // Embedded subqueries render after the FROM list: their
        // correlated references point at the aliases above.
        for embedded in &frame.embed {
            let sql = match &embedded.kind {
                FrameKind::Nested(nested) => self.dump_nested(nested)?,
                _ => return Err(Error::simple("expected a nested embedded frame").into()),
            };
            self.embedded.insert(embedded.tag, sql);
        }

        let mut sql = String::from("SELECT ");
        for (index, phrase) in frame.select.iter().enumerate() {
            if index > 0 {
                sql.push_str(", ");
            }
            write!(sql, "{} AS c{}", self.dump_phrase(phrase)?, index + 1).unwrap();
        }
        sql.push_str(&from);
        if let Some(condition) = &frame.where_ {
            write!(sql, " WHERE {}", self.dump_phrase(condition)?).unwrap();
        }
        if !frame.group.is_empty() {
            let items = frame
                .group
                .iter()
                .map(|phrase| self.dump_phrase(phrase))
                .collect::<Result<Vec<_>>>()?;
            write!(sql, " GROUP BY {}", items.join(", ")).unwrap();
        }
        if let Some(condition) = &frame.having {
            write!(sql, " HAVING {}", self.dump_phrase(condition)?).unwrap();
        }
        if !frame.order.is_empty() {
            let items = frame
                .order
                .iter()
                .map(|phrase| self.dump_order_item(phrase))
                .collect::<Result<Vec<_>>>()?;
            write!(sql, " ORDER BY {}", items.join(", ")).unwrap();
        }
        if let Some(limit) = frame.limit {
            write!(sql, " LIMIT {limit}").unwrap();
        }
        if let Some(offset) = frame.offset {
            write!(sql, " OFFSET {offset}").unwrap();
        }
        Ok(sql)
    }

    fn dump_order_item(&mut self, phrase: &Phrase) -> Result<String> {
        if let PhraseKind::Formula {
            signature: Signature::SortDirection { direction },
            arguments,
        } = &phrase.kind
        {
            let base = self.dump_phrase(&arguments[0])?;
            return Ok(match direction {
                Direction::Ascending => format!("{base} ASC"),
                Direction::Descending => format!("{base} DESC"),
            });
        }
        self.dump_phrase(phrase)
    }

    fn dump_phrase(&mut self, phrase: &Phrase) -> Result<String> {
        Ok(match &phrase.kind {
            PhraseKind::Literal(value) => dump_value(value),
            PhraseKind::Column { tag, column } => {
                let name = quote_name(&self.catalog.column(*column).name);
                format!("{}.{}", quote_name(self.alias(*tag)?), name)
            }
            PhraseKind::Reference { tag, index } => {
                format!("{}.c{}", quote_name(self.alias(*tag)?), index + 1)
            }
            PhraseKind::Embedding { tag } => {
                let sql = self
                    .embedded
                    .get(tag)
                    .cloned()
                    .ok_or_else(|| -> anyhow::Error {
                        Error::simple("expected an embedded frame").into()
                    })?;
                format!("({sql})")
            }
            PhraseKind::Cast { base } => {
                let base = self.dump_phrase(base)?;
                format!("CAST({base} AS {})", sql_type(&phrase.domain)?)
            }
            PhraseKind::Formula {
                signature,
                arguments,
            } => self.dump_formula(signature, arguments)?,
        })
    }

    fn dump_formula(&mut self, signature: &Signature, arguments: &[Phrase]) -> Result<String> {
        let args = |this: &mut Self| -> Result<Vec<String>> {
            arguments
                .iter()
                .map(|argument| this.dump_phrase(argument))
                .collect()
        };
        Ok(match signature {
            Signature::IsEqual { polarity } => {
                let args = args(self)?;
                let op = if polarity.is_positive() { "=" } else { "<>" };
                format!("({} {} {})", args[0], op, args[1])
            }
            Signature::IsTotallyEqual { polarity } => {
                let args = args(self)?;
                let op = if polarity.is_positive() {
                    "IS NOT DISTINCT FROM"
                } else {
                    "IS DISTINCT FROM"
                };
                format!("({} {} {})", args[0], op, args[1])
            }
            Signature::IsIn { polarity } => {
                let args = args(self)?;
                let op = if polarity.is_positive() { "IN" } else { "NOT IN" };
                format!("({} {} ({}))", args[0], op, args[1..].join(", "))
            }
            Signature::IsNull { polarity } => {
                let args = args(self)?;
                if polarity.is_positive() {
                    format!("({} IS NULL)", args[0])
                } else {
                    format!("({} IS NOT NULL)", args[0])
                }
            }
            Signature::IfNull => {
                let args = args(self)?;
                format!("COALESCE({}, {})", args[0], args[1])
            }
            Signature::NullIf => {
                let args = args(self)?;
                format!("NULLIF({}, {})", args[0], args[1])
            }
            Signature::Compare { relation } => {
                let args = args(self)?;
                format!("({} {} {})", args[0], relation.as_str(), args[1])
            }
            Signature::And => format!("({})", args(self)?.join(" AND ")),
            Signature::Or => format!("({})", args(self)?.join(" OR ")),
            Signature::Not => format!("(NOT {})", args(self)?[0]),
            Signature::Add => {
                let args = args(self)?;
                format!("({} + {})", args[0], args[1])
            }
            Signature::Subtract => {
                let args = args(self)?;
                format!("({} - {})", args[0], args[1])
            }
            Signature::Multiply => {
                let args = args(self)?;
                format!("({} * {})", args[0], args[1])
            }
            Signature::Divide => {
                let args = args(self)?;
                format!("({} / {})", args[0], args[1])
            }
            Signature::Negate => format!("(- {})", args(self)?[0]),
            Signature::Concatenate => {
                let args = args(self)?;
                format!("({} || {})", args[0], args[1])
            }
            Signature::Count => format!("COUNT({})", args(self)?[0]),
            Signature::Sum => format!("SUM({})", args(self)?[0]),
            Signature::Min => format!("MIN({})", args(self)?[0]),
            Signature::Max => format!("MAX({})", args(self)?[0]),
            Signature::Exists => format!("EXISTS{}", args(self)?[0]),
            Signature::Like { polarity } => {
                let args = args(self)?;
                let op = if polarity.is_positive() {
                    "LIKE"
                } else {
                    "NOT LIKE"
                };
                format!("({} {} {} ESCAPE '\\')", args[0], op, args[1])
            }
            Signature::Replace => {
                let args = args(self)?;
                format!("REPLACE({}, {}, {})", args[0], args[1], args[2])
            }
            Signature::Substring { has_length } => {
                let args = args(self)?;
                if *has_length {
                    format!("SUBSTRING({} FROM {} FOR {})", args[0], args[1], args[2])
                } else {
                    format!("SUBSTRING({} FROM {})", args[0], args[1])
                }
            }
            Signature::CharLength => format!("CHARACTER_LENGTH({})", args(self)?[0]),
            Signature::If {
                branches,
                has_alternative,
            } => {
                let args = args(self)?;
                let mut sql = String::from("(CASE");
                for branch in 0..*branches {
                    write!(
                        sql,
                        " WHEN {} THEN {}",
                        args[branch],
                        args[branches + branch]
                    )
                    .unwrap();
                }
                if *has_alternative {
                    write!(sql, " ELSE {}", args[2 * branches]).unwrap();
                }
                sql.push_str(" END)");
                sql
            }
            Signature::SortDirection { direction } => {
                // Reached inside window specifications.
                let base = self.dump_phrase(&arguments[0])?;
                match direction {
                    Direction::Ascending => format!("{base} ASC"),
                    Direction::Descending => format!("{base} DESC"),
                }
            }
            Signature::RowNumber { partition, order } => {
                let args = args(self)?;
                let mut sql = String::from("(ROW_NUMBER() OVER (");
                let mut spacer = "";
                if *partition > 0 {
                    write!(sql, "PARTITION BY {}", args[..*partition].join(", ")).unwrap();
                    spacer = " ";
                }
                if *order > 0 {
                    write!(
                        sql,
                        "{spacer}ORDER BY {}",
                        args[*partition..*partition + *order].join(", ")
                    )
                    .unwrap();
                }
                sql.push_str("))");
                sql
            }
            other => {
                return Err(Error::simple(format!(
                    "cannot serialize a {} formula",
                    other.as_ref()
                ))
                .into())
            }
        })
    }
}

/// Merges pass-through frames into their parents.
///
/// The assembler emits one frame per term, which leaves long chains of
/// single-child selects.  A leading child with no clauses of its own can
/// be folded into its parent: the parent takes over its `FROM` list and
/// embedded subqueries, references into the child are replaced by the
/// child's select items, and the child's `WHERE` conjoins with the
/// parent's.  Frames with grouping, ordering, slicing, or a permanence
/// mark keep their own rows and never fold.
fn collapse(mut frame: NestedFrame) -> NestedFrame {
    // Children first: non-leading anchors and embedded frames stay
    // separate subqueries but collapse internally.
    for anchor in &mut frame.include {
        collapse_frame(&mut anchor.frame);
    }
    for embedded in &mut frame.embed {
        collapse_frame(embedded);
    }

    loop {
        let Some(leading) = frame.include.first() else {
            break;
        };
        let FrameKind::Nested(kid) = &leading.frame.kind else {
            break;
        };
        if kid.is_permanent
            || !kid.group.is_empty()
            || kid.having.is_some()
            || !kid.order.is_empty()
            || kid.limit.is_some()
            || kid.offset.is_some()
        {
            break;
        }
        let anchor = frame.include.remove(0);
        let kid_tag = anchor.frame.tag;
        let FrameKind::Nested(kid) = anchor.frame.kind else {
            unreachable!();
        };
        let kid = *kid;

        // The child's FROM list leads; the remaining anchors follow.
        let mut include = kid.include;
        include.append(&mut frame.include);
        frame.include = include;
        let mut embed = kid.embed;
        embed.append(&mut frame.embed);
        frame.embed = embed;

        // References into the child resolve to its select items.
        let items = kid.select;
        for phrase in &mut frame.select {
            substitute(phrase, kid_tag, &items);
        }
        if let Some(condition) = &mut frame.where_ {
            substitute(condition, kid_tag, &items);
        }
        for phrase in &mut frame.group {
            substitute(phrase, kid_tag, &items);
        }
        if let Some(condition) = &mut frame.having {
            substitute(condition, kid_tag, &items);
        }
        for phrase in &mut frame.order {
            substitute(phrase, kid_tag, &items);
        }
        for anchor in &mut frame.include {
            if let Some(condition) = &mut anchor.condition {
                substitute(condition, kid_tag, &items);
            }
        }

        // The child's filter applies before anything the parent adds.
        frame.where_ = match (kid.where_, frame.where_.take()) {
            (None, outer) => outer,
            (inner, None) => inner,
            (Some(inner), Some(outer)) => Some(Phrase {
                domain: Domain::Boolean,
                is_nullable: inner.is_nullable || outer.is_nullable,
                kind: PhraseKind::Formula {
                    signature: Signature::And,
                    arguments: vec![inner, outer],
                },
            }),
        };
    }
    frame
}

fn collapse_frame(frame: &mut Frame) {
    if let FrameKind::Nested(nested) = &mut frame.kind {
        let taken = std::mem::replace(
            nested.as_mut(),
            NestedFrame {
                include: Vec::new(),
                embed: Vec::new(),
                select: Vec::new(),
                where_: None,
                group: Vec::new(),
                having: None,
                order: Vec::new(),
                limit: None,
                offset: None,
                is_permanent: false,
            },
        );
        **nested = collapse(taken);
    }
}

fn substitute(phrase: &mut Phrase, tag: Tag, items: &[Phrase]) {
    let replacement = match &phrase.kind {
        PhraseKind::Reference {
            tag: reference_tag,
            index,
        } if *reference_tag == tag => Some(items[*index].clone()),
        _ => None,
    };
    if let Some(replacement) = replacement {
        phrase.kind = replacement.kind;
        phrase.domain = replacement.domain;
        return;
    }
    match &mut phrase.kind {
        PhraseKind::Cast { base } => substitute(base, tag, items),
        PhraseKind::Formula { arguments, .. } => {
            for argument in arguments {
                substitute(argument, tag, items);
            }
        }
        _ => {}
    }
}

/// A frame that selects nothing but the `TRUE` placeholder and applies
/// no clauses; it cannot be referenced and is safe to drop from a cross
/// join.
fn is_vacuous(frame: &Frame) -> bool {
    match &frame.kind {
        FrameKind::Scalar => true,
        FrameKind::Nested(nested) => {
            nested.select.len() == 1
                && matches!(
                    nested.select[0].kind,
                    PhraseKind::Literal(Value::Boolean(true))
                )
                && nested.where_.is_none()
                && nested.group.is_empty()
                && nested.having.is_none()
                && nested.order.is_empty()
                && nested.limit.is_none()
                && nested.offset.is_none()
                && nested.embed.is_empty()
                && nested
                    .include
                    .iter()
                    .all(|anchor| is_vacuous(&anchor.frame) && anchor.is_cross())
        }
        _ => false,
    }
}

fn dump_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Boolean(true) => "TRUE".to_owned(),
        Value::Boolean(false) => "FALSE".to_owned(),
        Value::Integer(value) => value.to_string(),
        Value::Float(value) => format!("{value:?}"),
        Value::Decimal(text) => text.clone(),
        Value::Text(text) => format!("'{}'", text.replace('\'', "''")),
        Value::Date(text) => format!("DATE '{text}'"),
        Value::Time(text) => format!("TIME '{text}'"),
        Value::DateTime(text) => format!("TIMESTAMP '{text}'"),
    }
}

fn sql_type(domain: &Domain) -> Result<&'static str> {
    Ok(match domain {
        Domain::Boolean => "BOOLEAN",
        Domain::Integer => "INTEGER",
        Domain::Decimal { .. } => "DECIMAL",
        Domain::Float => "DOUBLE PRECISION",
        Domain::Text { .. } | Domain::Enum(_) | Domain::Untyped | Domain::Opaque => "VARCHAR",
        Domain::Date => "DATE",
        Domain::Time => "TIME",
        Domain::DateTime => "TIMESTAMP",
        other => {
            return Err(Error::simple(format!("cannot serialize a value of type {other}")).into())
        }
    })
}

/// Renders one segment frame into SQL.
pub fn dump(frame: &SegmentFrame, catalog: &Catalog) -> Result<String> {
    let mut serializer = Serializer::new(catalog);
    let nested = collapse(frame.nested.clone());
    serializer.dump_nested(&nested)
}

/// Renders the segment tree into SQL statements and combines them into
/// a rows pipe: dependent results merge into the parent rows through a
/// sorted merge-join on the segment keys.
pub fn serialize(frame: &SegmentFrame, catalog: &Catalog) -> Result<(String, Pipe)> {
    log::debug!("serializing frames to SQL");
    let sql = dump(frame, catalog)?;
    let rows = Pipe::Sql {
        sql: sql.clone(),
        input: None,
        output: frame.domains.clone(),
    };
    if frame.dependents.is_empty() {
        return Ok((sql, rows));
    }
    let mut fields = vec![rows];
    let mut keys = vec![frame.key_pipe.clone()];
    for dependent in &frame.dependents {
        let (_, pipe) = serialize(dependent, catalog)?;
        keys.push(dependent.superkey_pipe.clone());
        fields.push(pipe);
    }
    Ok((sql, Pipe::Record(fields).compose(Pipe::Mix { keys })))
}

/// Pretty-prints a generated statement.
pub fn pretty(sql: &str) -> String {
    sqlformat::format(
        sql,
        &sqlformat::QueryParams::None,
        sqlformat::FormatOptions::default(),
    )
}
