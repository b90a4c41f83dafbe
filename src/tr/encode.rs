//! Flow → Space + Code.
//!
//! Two walks run in lockstep over the flow tree: `relate` builds the
//! data-flow part (a space), `encode` builds the value-expression part
//! (a code).  `unpack` dissects a collect flow into a segment bundle.
//! `convert` is the cast sub-adapter enforcing the promotion matrix.

use std::collections::HashMap;
use std::rc::Rc;

use crate::catalog::Catalog;
use crate::domain::{Domain, Value};
use crate::error::{guard, Error, Result};
use crate::tr::coerce::coerce_unary;
use crate::tr::flow::{Flow, FlowKey, FlowKind};
use crate::tr::signature::{AggregateOp, Polarity, Signature};
use crate::tr::space::{Code, SegmentExpr, Space, Unit};

/// The dissected content of a flow: its output columns and nested
/// segments.
pub struct Bundle {
    pub codes: Vec<Rc<Code>>,
    pub segments: Vec<Rc<SegmentExpr>>,
}

pub struct EncodingState<'a> {
    pub catalog: &'a Catalog,
    code_cache: HashMap<FlowKey, Rc<Code>>,
    space_cache: HashMap<FlowKey, Rc<Space>>,
}

impl<'a> EncodingState<'a> {
    pub fn new(catalog: &'a Catalog) -> EncodingState<'a> {
        EncodingState {
            catalog,
            code_cache: HashMap::new(),
            space_cache: HashMap::new(),
        }
    }

    pub fn encode(&mut self, flow: &Rc<Flow>) -> Result<Rc<Code>> {
        if let Some(code) = self.code_cache.get(&FlowKey::of(flow)) {
            return Ok(code.clone());
        }
        let code = guard(flow.span, || self.encode_uncached(flow))?;
        self.code_cache.insert(FlowKey::of(flow), code.clone());
        Ok(code)
    }

    pub fn relate(&mut self, flow: &Rc<Flow>) -> Result<Rc<Space>> {
        if let Some(space) = self.space_cache.get(&FlowKey::of(flow)) {
            return Ok(space.clone());
        }
        let space = guard(flow.span, || self.relate_uncached(flow))?;
        self.space_cache.insert(FlowKey::of(flow), space.clone());
        Ok(space)
    }

    fn encode_uncached(&mut self, flow: &Rc<Flow>) -> Result<Rc<Code>> {
        match &flow.kind {
            FlowKind::Column { base, column, .. } => {
                let space = self.relate(base)?;
                Ok(Rc::new(Code::Unit(Unit::Column {
                    column: *column,
                    space,
                    domain: self.catalog.column(*column).domain.clone(),
                })))
            }
            FlowKind::Kernel { base, index, .. } => {
                // The kernel expression is extracted from the quotient
                // family of the scope space.
                let space = self.relate(base)?;
                let code = space
                    .quotient_kernels()
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| Error::simple("kernel index out of range"))?;
                Ok(Rc::new(Code::Unit(Unit::Kernel { code, space })))
            }
            FlowKind::Literal { value, .. } => {
                Ok(Code::literal(value.clone(), flow.domain.clone()))
            }
            FlowKind::Cast { .. } => self.convert(flow),
            FlowKind::Rescoping { base, scope } => {
                let code = self.encode(base)?;
                let space = self.relate(scope)?;
                Ok(Rc::new(Code::Unit(Unit::Scalar {
                    code,
                    space,
                    companions: Vec::new(),
                })))
            }
            FlowKind::Formula {
                base,
                signature,
                arguments,
            } => self.encode_formula(flow, base, signature, arguments),
            FlowKind::Clip {
                base,
                seed,
                limit,
                offset,
                ..
            } => self.encode_clip(flow, base, seed, *limit, *offset),
            _ => Err(Error::simple("expected a code expression").into()),
        }
    }

    fn relate_uncached(&mut self, flow: &Rc<Flow>) -> Result<Rc<Space>> {
        match &flow.kind {
            FlowKind::Root => Ok(Space::root()),
            FlowKind::Home { base } => {
                let base = self.relate(base)?;
                Ok(Space::scalar(base))
            }
            FlowKind::Table { base, table } => {
                let base = self.relate(base)?;
                Ok(Space::direct_table(base, *table))
            }
            FlowKind::Chain { base, joins } => {
                let mut space = self.relate(base)?;
                for join in joins {
                    space = Space::fiber_table(space, join.clone());
                }
                Ok(space)
            }
            FlowKind::Sieve { base, filter } => {
                let space = self.relate(base)?;
                let filter = self.encode(filter)?;
                Ok(Space::filtered(space, filter))
            }
            FlowKind::Sort {
                base,
                order,
                limit,
                offset,
            } => {
                let space = self.relate(base)?;
                let mut encoded = Vec::new();
                for (item, direction) in order {
                    encoded.push((self.encode(item)?, *direction));
                }
                Ok(Space::ordered(space, encoded, *limit, *offset))
            }
            FlowKind::Quotient {
                base,
                seed,
                kernels,
            } => {
                let base_space = self.relate(base)?;
                let seed_space = self.relate(seed)?;
                guard(seed.span, || {
                    if base_space.spans(&seed_space) {
                        return Err(Error::simple("expected a plural expression").into());
                    }
                    if !seed_space.spans(&base_space) {
                        return Err(Error::simple("expected a descendant expression").into());
                    }
                    Ok(())
                })?;
                let kernels = kernels
                    .iter()
                    .map(|kernel| self.encode(kernel))
                    .collect::<Result<Vec<_>>>()?;
                // A scalar kernel cannot be rejected here: unmasking may
                // still remove phantom units, so the check lives there.
                Ok(Space::quotient(base_space, seed_space, kernels))
            }
            FlowKind::Complement { base, .. } => {
                let base = self.relate(base)?;
                Ok(Space::complement(base))
            }
            FlowKind::Cover { base, seed } => {
                let base = self.relate(base)?;
                let seed = self.relate(seed)?;
                Ok(Space::moniker(base, seed, Vec::new()))
            }
            FlowKind::Fork { base, kernels } => {
                let base = self.relate(base)?;
                // The seed coincides with the parent space; rewriting may
                // change that later.
                let seed = base.clone();
                let kernels = kernels
                    .iter()
                    .map(|kernel| self.encode(kernel))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Space::forked(base, seed, kernels, Vec::new()))
            }
            FlowKind::Attach {
                base,
                seed,
                images,
                condition,
            } => {
                let base = self.relate(base)?;
                let seed = self.relate(seed)?;
                let images = images
                    .iter()
                    .map(|(lop, rop)| Ok((self.encode(lop)?, self.encode(rop)?)))
                    .collect::<Result<Vec<_>>>()?;
                let filter = condition
                    .as_ref()
                    .map(|condition| self.encode(condition))
                    .transpose()?;
                Ok(Space::attach(base, seed, images, filter, Vec::new()))
            }
            FlowKind::Locate {
                base,
                seed,
                images,
                condition,
            } => {
                let base = self.relate(base)?;
                let seed = self.relate(seed)?;
                let images = images
                    .iter()
                    .map(|(lop, rop)| Ok((self.encode(lop)?, self.encode(rop)?)))
                    .collect::<Result<Vec<_>>>()?;
                let filter = condition
                    .as_ref()
                    .map(|condition| self.encode(condition))
                    .transpose()?;
                Ok(Space::locator(base, seed, images, filter, Vec::new()))
            }
            FlowKind::Clip {
                base,
                seed,
                limit,
                offset,
                ..
            } => {
                let base_space = self.relate(base)?;
                let seed_space = self.relate(seed)?;
                if !(seed_space.spans(&base_space) && !base_space.spans(&seed_space)) {
                    return guard(seed.span, || {
                        Err(Error::simple("expected a plural expression").into())
                    });
                }
                Ok(Space::clipped(
                    base_space, seed_space, *limit, *offset,
                    Vec::new(),
                ))
            }
            FlowKind::Column { base, link, .. } => {
                // A column with an associated link relates through it.
                match link {
                    Some(link) => self.relate(link),
                    None => match flow.base() {
                        Some(base) => self.relate(base),
                        None => Err(Error::simple("expected a flow expression").into()),
                    },
                }
            }
            FlowKind::Selection { base, .. } | FlowKind::Identity { base, .. } => {
                self.relate(base)
            }
            // Everything else delegates to its base scope.
            _ => match flow.base() {
                Some(base) => self.relate(base),
                None => Err(Error::simple("expected a flow expression").into()),
            },
        }
    }

    fn encode_formula(
        &mut self,
        flow: &Rc<Flow>,
        base: &Rc<Flow>,
        signature: &Signature,
        arguments: &[Rc<Flow>],
    ) -> Result<Rc<Code>> {
        match signature {
            Signature::Aggregate { op } => self.encode_aggregate(flow, base, *op, arguments),
            Signature::Quantify { polarity } => {
                self.encode_quantify(flow, base, *polarity, arguments)
            }
            _ => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.encode(argument))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Code::formula(
                    signature.clone(),
                    flow.domain.clone(),
                    arguments,
                ))
            }
        }
    }

    /// Deduces the plural space of an aggregate operand from its units.
    fn deduce_plural(&self, units: &[Unit], space: &Rc<Space>) -> Result<Rc<Space>> {
        let plural_units: Vec<&Unit> = units
            .iter()
            .filter(|unit| !space.spans(unit.space()))
            .collect();
        if plural_units.is_empty() {
            return Err(Error::simple("expected a plural operand").into());
        }
        let mut plural_spaces: Vec<Rc<Space>> = Vec::new();
        for unit in plural_units {
            if plural_spaces
                .iter()
                .any(|candidate| candidate.dominates(unit.space()))
            {
                continue;
            }
            plural_spaces.retain(|candidate| !unit.space().dominates(candidate));
            plural_spaces.push(unit.space().clone());
        }
        if plural_spaces.len() > 1 {
            return Err(Error::simple("cannot deduce an unambiguous aggregate flow").into());
        }
        let plural_space = plural_spaces.pop().unwrap();
        if space.spans(&plural_space) {
            return Err(Error::simple("expected a plural operand").into());
        }
        if !plural_space.spans(space) {
            return Err(Error::simple("expected a descendant operand").into());
        }
        Ok(plural_space)
    }

    fn encode_aggregate(
        &mut self,
        flow: &Rc<Flow>,
        base: &Rc<Flow>,
        op: AggregateOp,
        arguments: &[Rc<Flow>],
    ) -> Result<Rc<Code>> {
        let operand = self.encode(&arguments[0])?;
        let space = self.relate(base)?;
        let plural_space = guard(flow.span, || self.deduce_plural(&operand.units(), &space))?;

        let (aggregate_code, zero) = match op {
            AggregateOp::Count => {
                // `count(p)` ignores both NULL and false rows.
                let operand = Code::formula(
                    Signature::NullIf,
                    operand.domain().clone(),
                    vec![operand, Code::false_literal()],
                );
                (
                    Code::formula(Signature::Count, Domain::Integer, vec![operand]),
                    Some(Code::integer_literal(0)),
                )
            }
            AggregateOp::Sum => {
                let domain = operand.domain().clone();
                let zero = domain
                    .parse("0")
                    .map(|value| Code::literal(value, domain.clone()))
                    .unwrap_or_else(|_| Code::integer_literal(0));
                (
                    Code::formula(Signature::Sum, domain, vec![operand]),
                    Some(zero),
                )
            }
            AggregateOp::Min => (
                Code::formula(Signature::Min, operand.domain().clone(), vec![operand]),
                None,
            ),
            AggregateOp::Max => (
                Code::formula(Signature::Max, operand.domain().clone(), vec![operand]),
                None,
            ),
        };
        let domain = aggregate_code.domain().clone();
        let unit = Rc::new(Code::Unit(Unit::Aggregate {
            code: aggregate_code,
            plural_space,
            space: space.clone(),
            companions: Vec::new(),
        }));
        // `count` and `sum` of an empty set produce 0, not NULL.
        let wrapper = match zero {
            Some(zero) => Code::formula(Signature::IfNull, domain, vec![unit, zero]),
            None => unit,
        };
        Ok(Rc::new(Code::Unit(Unit::Scalar {
            code: wrapper,
            space,
            companions: Vec::new(),
        })))
    }

    fn encode_quantify(
        &mut self,
        flow: &Rc<Flow>,
        base: &Rc<Flow>,
        polarity: Polarity,
        arguments: &[Rc<Flow>],
    ) -> Result<Rc<Code>> {
        let mut op = self.encode(&arguments[0])?;
        let space = self.relate(base)?;
        let plural_space = guard(flow.span, || self.deduce_plural(&op.units(), &space))?;
        if !polarity.is_positive() {
            op = Code::formula(Signature::Not, Domain::Boolean, vec![op]);
        }
        let plural_space = Space::filtered(plural_space, op);
        let unit = Rc::new(Code::Unit(Unit::Correlated {
            code: Code::true_literal(),
            plural_space,
            space: space.clone(),
        }));
        let mut wrapper = Code::formula(Signature::Exists, Domain::Boolean, vec![unit]);
        if !polarity.is_positive() {
            wrapper = Code::formula(Signature::Not, Domain::Boolean, vec![wrapper]);
        }
        Ok(Rc::new(Code::Unit(Unit::Scalar {
            code: wrapper,
            space,
            companions: Vec::new(),
        })))
    }

    /// A clip flow used in code position becomes a covering unit over a
    /// clipped space.
    fn encode_clip(
        &mut self,
        _flow: &Rc<Flow>,
        base: &Rc<Flow>,
        seed: &Rc<Flow>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Rc<Code>> {
        let root = self.relate(base)?;
        let code = self.encode(seed)?;
        let units = code.units();
        let space = if units.is_empty() {
            Space::root()
        } else {
            let mut spaces: Vec<Rc<Space>> = Vec::new();
            for unit in &units {
                if spaces.iter().any(|candidate| candidate.dominates(unit.space())) {
                    continue;
                }
                spaces.retain(|candidate| !unit.space().dominates(candidate));
                spaces.push(unit.space().clone());
            }
            if spaces.len() > 1 {
                return Err(Error::simple("cannot deduce an unambiguous clip flow").into());
            }
            spaces.pop().unwrap()
        };
        if !space.spans(&root) {
            return Err(Error::simple("expected a descendant clip flow").into());
        }
        let filter = Code::is_not_null(code.clone());
        let space = Space::filtered(space, filter);
        let space = Space::clipped(root, space, limit, offset, Vec::new());
        Ok(Rc::new(Code::Unit(Unit::Covering { code, space })))
    }

    /// The cast sub-adapter; dispatched on the origin and target domains.
    fn convert(&mut self, flow: &Rc<Flow>) -> Result<Rc<Code>> {
        let FlowKind::Cast { base } = &flow.kind else {
            unreachable!("convert applies to cast flows");
        };
        let origin = &base.domain;
        let target = &flow.domain;
        use Domain::*;
        match (origin, target) {
            // Untyped literals parse into the target domain.
            (Untyped, _) => {
                let code = self.encode(base)?;
                // The literal may have been rescoped into scalar units;
                // unwrap them, convert, wrap back.
                let mut wrappers = Vec::new();
                let mut inner = code;
                loop {
                    let next = match &*inner {
                        Code::Unit(Unit::Scalar {
                            code,
                            space,
                            companions,
                        }) => {
                            wrappers.push((space.clone(), companions.clone()));
                            code.clone()
                        }
                        _ => break,
                    };
                    inner = next;
                }
                let Code::Literal { value, .. } = &*inner else {
                    return Err(Error::simple(format!(
                        "cannot convert a value of type {origin} to {target}"
                    ))
                    .into());
                };
                let value = match value {
                    Value::Null => Value::Null,
                    Value::Text(text) => target.parse(text)?,
                    other => other.clone(),
                };
                let mut code = Code::literal(value, target.clone());
                while let Some((space, companions)) = wrappers.pop() {
                    code = Rc::new(Code::Unit(Unit::Scalar {
                        code,
                        space,
                        companions,
                    }));
                }
                Ok(code)
            }
            // Conversion to itself drops the cast.
            (origin, target) if origin == target => self.encode(base),
            (Boolean, Boolean)
            | (Integer, Integer)
            | (Float, Float)
            | (Decimal { .. }, Decimal { .. })
            | (Text { .. }, Text { .. })
            | (Date, Date)
            | (Time, Time)
            | (DateTime, DateTime) => self.encode(base),
            // A record expression tests whether the space is non-empty.
            (Entity(_), Boolean) | (Record(_), Boolean) => {
                let space = self.relate(base)?;
                let unit = Unit::Scalar {
                    code: Code::true_literal(),
                    space,
                    companions: Vec::new(),
                };
                Ok(Code::is_not_null(unit.into_code()))
            }
            // NULL and the empty string are both false.
            (Text { .. }, Boolean) => {
                let code = self.encode(base)?;
                let empty = Code::literal(Value::Text(String::new()), origin.clone());
                let code = Code::formula(Signature::NullIf, origin.clone(), vec![code, empty]);
                Ok(Code::is_not_null(code))
            }
            (Integer, Boolean)
            | (Decimal { .. }, Boolean)
            | (Float, Boolean)
            | (Enum(_), Boolean)
            | (Date, Boolean)
            | (Time, Boolean)
            | (DateTime, Boolean)
            | (Opaque, Boolean) => {
                let code = self.encode(base)?;
                Ok(Code::is_not_null(code))
            }
            (Boolean, Text { .. })
            | (Integer, Text { .. })
            | (Decimal { .. }, Text { .. })
            | (Float, Text { .. })
            | (Enum(_), Text { .. })
            | (Date, Text { .. })
            | (Time, Text { .. })
            | (DateTime, Text { .. })
            | (Opaque, Text { .. }) => self.cast_code(base, target),
            (Decimal { .. }, Integer) | (Float, Integer) | (Text { .. }, Integer) => {
                self.cast_code(base, target)
            }
            (Integer, Decimal { .. }) => {
                // Fold an integer literal in place; other origins are
                // engine business.
                let code = self.encode(base)?;
                if let Code::Literal { value, .. } = &*code {
                    let value = match value {
                        Value::Null => Value::Null,
                        Value::Integer(value) => Value::Decimal(value.to_string()),
                        other => other.clone(),
                    };
                    return Ok(Code::literal(value, target.clone()));
                }
                Ok(Rc::new(Code::Cast {
                    base: code,
                    domain: target.clone(),
                }))
            }
            (Float, Decimal { .. }) | (Text { .. }, Decimal { .. }) => {
                self.cast_code(base, target)
            }
            (Integer, Float) | (Decimal { .. }, Float) => {
                let code = self.encode(base)?;
                if let Code::Literal { value, .. } = &*code {
                    let value = match value {
                        Value::Null => Value::Null,
                        Value::Integer(value) => Value::Float(*value as f64),
                        Value::Decimal(text) => {
                            Value::Float(text.parse().unwrap_or(f64::NAN))
                        }
                        other => other.clone(),
                    };
                    return Ok(Code::literal(value, target.clone()));
                }
                Ok(Rc::new(Code::Cast {
                    base: code,
                    domain: target.clone(),
                }))
            }
            (Text { .. }, Float) => self.cast_code(base, target),
            (Text { .. }, Date) | (DateTime, Date) => self.cast_code(base, target),
            (Text { .. }, Time) | (DateTime, Time) => self.cast_code(base, target),
            (Text { .. }, DateTime) | (Date, DateTime) => self.cast_code(base, target),
            (origin, target) => Err(Error::simple(format!(
                "cannot convert a value of type {origin} to {target}"
            ))
            .into()),
        }
    }

    fn cast_code(&mut self, base: &Rc<Flow>, target: &Domain) -> Result<Rc<Code>> {
        let code = self.encode(base)?;
        Ok(Rc::new(Code::Cast {
            base: code,
            domain: target.clone(),
        }))
    }

    pub fn unpack(&mut self, flow: &Rc<Flow>) -> Result<Bundle> {
        guard(flow.span, || match &flow.kind {
            FlowKind::Collect { base, seed } => self.unpack_collect(flow, base, seed),
            FlowKind::Selection { elements, .. } => self.unpack_selection(flow, elements),
            FlowKind::Identity { elements, .. } => self.unpack_identity(flow, elements),
            _ => Ok(Bundle {
                codes: vec![self.encode(flow)?],
                segments: Vec::new(),
            }),
        })
    }

    fn unpack_collect(
        &mut self,
        flow: &Rc<Flow>,
        base: &Rc<Flow>,
        seed: &Rc<Flow>,
    ) -> Result<Bundle> {
        let root = self.relate(base)?;
        let mut bundle = None;
        let mut code = None;
        let mut units = Vec::new();
        let mut space = None;
        if coerce_unary(&seed.domain).is_some() {
            let encoded = self.encode(seed)?;
            units = encoded.units();
            code = Some(encoded);
        } else if matches!(seed.domain, Domain::Record(_) | Domain::Identity(_)) {
            bundle = Some(self.unpack(seed)?);
            space = Some(self.relate(seed)?);
        } else {
            let unpacked = self.unpack(seed)?;
            units = unpacked
                .codes
                .iter()
                .flat_map(|code| code.units())
                .collect();
            bundle = Some(unpacked);
        }
        let space = match space {
            Some(space) => space,
            None => {
                if units.is_empty() {
                    Space::root()
                } else {
                    let mut spaces: Vec<Rc<Space>> = Vec::new();
                    for unit in &units {
                        if spaces
                            .iter()
                            .any(|candidate| candidate.dominates(unit.space()))
                        {
                            continue;
                        }
                        spaces.retain(|candidate| !unit.space().dominates(candidate));
                        spaces.push(unit.space().clone());
                    }
                    if spaces.len() > 1 {
                        return Err(
                            Error::simple("cannot deduce an unambiguous segment flow").into()
                        );
                    }
                    spaces.pop().unwrap()
                }
            }
        };
        if !space.spans(&root) {
            return Err(Error::simple("expected a descendant segment flow").into());
        }
        let (codes, dependents, space) = match bundle {
            None => {
                let code = code.unwrap();
                let space = match &*code {
                    Code::Literal {
                        value,
                        domain: Domain::Untyped,
                    } => {
                        if value.is_null() {
                            Space::filtered(space, Code::false_literal())
                        } else {
                            space
                        }
                    }
                    _ => Space::filtered(space, Code::is_not_null(code.clone())),
                };
                (vec![code], Vec::new(), space)
            }
            Some(bundle) => (bundle.codes, bundle.segments, space),
        };
        let segment = Rc::new(SegmentExpr {
            root,
            space,
            codes,
            dependents,
            flow: flow.clone(),
        });
        Ok(Bundle {
            codes: Vec::new(),
            segments: vec![segment],
        })
    }

    fn unpack_selection(&mut self, flow: &Rc<Flow>, elements: &[Rc<Flow>]) -> Result<Bundle> {
        let mut codes = Vec::new();
        let mut segments = Vec::new();
        let space = self.relate(flow)?;
        // A constant indicator marking the record as present.
        let indicator = Rc::new(Code::Unit(Unit::Scalar {
            code: Code::true_literal(),
            space,
            companions: Vec::new(),
        }));
        codes.push(indicator);
        for element in elements {
            let bundle = self.unpack(element)?;
            codes.extend(bundle.codes);
            segments.extend(bundle.segments);
        }
        Ok(Bundle { codes, segments })
    }

    fn unpack_identity(&mut self, flow: &Rc<Flow>, elements: &[Rc<Flow>]) -> Result<Bundle> {
        let mut codes: Vec<Rc<Code>> = Vec::new();
        let mut segments = Vec::new();
        let mut indicators: Vec<Rc<Code>> = Vec::new();
        let space = self.relate(flow)?;
        let true_indicator = Rc::new(Code::Unit(Unit::Scalar {
            code: Code::true_literal(),
            space: space.clone(),
            companions: Vec::new(),
        }));
        indicators.push(true_indicator.clone());
        for element in elements {
            let bundle = self.unpack(element)?;
            for code in &bundle.codes {
                let mut code = code.clone();
                match &*code {
                    Code::Unit(Unit::Scalar {
                        code: inner,
                        space: unit_space,
                        ..
                    }) if unit_space.dominates(&space)
                        && matches!(
                            &**inner,
                            Code::Literal {
                                value: Value::Boolean(true),
                                ..
                            }
                        ) =>
                    {
                        code = true_indicator.clone();
                    }
                    Code::Unit(Unit::Column {
                        column,
                        space: unit_space,
                        domain,
                    }) if !space.is_inflated
                        && unit_space.dominates(&space)
                        && unit_space != &space =>
                    {
                        code = Rc::new(Code::Unit(Unit::Column {
                            column: *column,
                            space: unit_space.inflate(),
                            domain: domain.clone(),
                        }));
                    }
                    _ => {}
                }
                codes.push(code);
            }
            segments.extend(bundle.segments);
            if let Some(indicator) = bundle.codes.first() {
                let mut indicator = indicator.clone();
                match &*indicator {
                    Code::Unit(Unit::Scalar {
                        code: inner,
                        space: unit_space,
                        ..
                    }) if unit_space.conforms(&space)
                        && matches!(
                            &**inner,
                            Code::Literal {
                                value: Value::Boolean(true),
                                ..
                            }
                        ) =>
                    {
                        continue;
                    }
                    Code::Unit(Unit::Column {
                        column,
                        space: unit_space,
                        ..
                    }) if unit_space.conforms(&space)
                        && !self.catalog.column(*column).is_nullable =>
                    {
                        continue;
                    }
                    Code::Formula {
                        signature:
                            Signature::IsNull {
                                polarity: Polarity::Negative,
                            },
                        ..
                    } => {}
                    _ => {
                        indicator = Code::is_not_null(indicator);
                    }
                }
                indicators.push(indicator);
            }
        }
        let indicator = if indicators.len() == 1 {
            indicators.pop().unwrap()
        } else {
            Code::formula(Signature::And, Domain::Boolean, indicators)
        };
        codes.insert(0, indicator);
        Ok(Bundle { codes, segments })
    }
}

/// Encodes a flow into a top-level segment expression.
///
/// A collect flow becomes the segment directly; any other flow is
/// wrapped into an implicit singular segment.
pub fn encode(flow: &Rc<Flow>, catalog: &Catalog) -> Result<Rc<SegmentExpr>> {
    log::debug!("encoding a flow into spaces and codes");
    let mut state = EncodingState::new(catalog);
    let bundle = state.unpack(flow)?;
    if bundle.codes.is_empty() && bundle.segments.len() == 1 {
        return Ok(bundle.segments.into_iter().next().unwrap());
    }
    let root = Space::root();
    let space = state.relate(flow)?;
    if !root.spans(&space)
        || bundle.codes.iter().any(|code| {
            code.units()
                .iter()
                .any(|unit| !space.spans(unit.space()))
        })
    {
        return guard(flow.span, || {
            Err(Error::simple("expected a singular expression").into())
        });
    }
    Ok(Rc::new(SegmentExpr {
        root,
        space,
        codes: bundle.codes,
        dependents: bundle.segments,
        flow: flow.clone(),
    }))
}
