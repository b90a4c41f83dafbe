//! Term → Frame.
//!
//! Units are routed through the term tree as claims: a *claim* asks the
//! *broker* frame to export a phrase the *target* frame is responsible
//! for evaluating.  Walking the tree top-down, each term forwards claims
//! to the child whose subtree holds the target, assembles its children
//! into a `FROM` list, satisfies its own claims in the `SELECT` list,
//! and builds the remaining clauses from its kind.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::catalog::Catalog;
use crate::domain::{Domain, Value};
use crate::error::{Error, Result};
use crate::tr::frame::{Anchor, Frame, FrameKind, NestedFrame, Phrase, PhraseKind, SegmentFrame};
use crate::tr::pipe::Pipe;
use crate::tr::signature::{Polarity, Signature};
use crate::tr::space::{Code, Unit};
use crate::tr::term::{Tag, Term, TermKind};

/// A request to the broker frame to export a unit evaluated at the
/// target frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Claim {
    pub unit: Unit,
    pub broker: Tag,
    pub target: Tag,
}

/// The dispatching context of the currently assembled frame.
#[derive(Debug, Clone)]
struct Gate {
    /// The frame is joined to its parent with an outer join: every
    /// export becomes nullable.
    is_nullable: bool,
    dispatches: HashMap<Tag, Tag>,
    routes: HashMap<Unit, Tag>,
}

pub struct AssemblingState<'a> {
    pub catalog: &'a Catalog,
    gate: Gate,
    gate_stack: Vec<Gate>,
    claim_set: HashSet<Claim>,
    claims_by_broker: HashMap<Tag, Vec<Claim>>,
    phrase_by_claim: HashMap<Claim, Phrase>,
    correlations: HashMap<Rc<Code>, Phrase>,
    correlations_stack: Vec<HashMap<Rc<Code>, Phrase>>,
}

impl<'a> AssemblingState<'a> {
    pub fn new(catalog: &'a Catalog) -> AssemblingState<'a> {
        AssemblingState {
            catalog,
            gate: Gate {
                is_nullable: false,
                dispatches: HashMap::new(),
                routes: HashMap::new(),
            },
            gate_stack: Vec::new(),
            claim_set: HashSet::new(),
            claims_by_broker: HashMap::new(),
            phrase_by_claim: HashMap::new(),
            correlations: HashMap::new(),
            correlations_stack: Vec::new(),
        }
    }

    /// Prepares the state for assembling one segment tree.
    fn set_tree(&mut self, term: &Term) {
        debug_assert!(matches!(term.kind, TermKind::Segment { .. }));
        self.gate = Gate {
            is_nullable: false,
            dispatches: term.offsprings.clone(),
            routes: term.routes.clone(),
        };
        self.claims_by_broker.insert(term.tag, Vec::new());
        for offspring in term.offsprings.keys() {
            self.claims_by_broker.insert(*offspring, Vec::new());
        }
    }

    fn push_gate(
        &mut self,
        is_nullable: Option<bool>,
        dispatcher: Option<&Term>,
        router: Option<&Term>,
    ) {
        let is_nullable = is_nullable.unwrap_or(self.gate.is_nullable);
        let dispatches = match dispatcher {
            Some(dispatcher) => dispatcher.offsprings.clone(),
            None => self.gate.dispatches.clone(),
        };
        // Changing the dispatcher implies changing the router with it.
        let router = router.or(dispatcher);
        let routes = match router {
            Some(router) => router.routes.clone(),
            None => self.gate.routes.clone(),
        };
        self.gate_stack.push(std::mem::replace(
            &mut self.gate,
            Gate {
                is_nullable,
                dispatches,
                routes,
            },
        ));
    }

    fn pop_gate(&mut self) {
        self.gate = self.gate_stack.pop().expect("unbalanced gate stack");
    }

    fn push_correlations(&mut self, correlations: HashMap<Rc<Code>, Phrase>) {
        self.correlations_stack
            .push(std::mem::replace(&mut self.correlations, correlations));
    }

    fn pop_correlations(&mut self) {
        self.correlations = self
            .correlations_stack
            .pop()
            .expect("unbalanced correlation stack");
    }

    /// Finds the target and broker for a unit and returns the claim.
    fn appoint(&self, unit: &Unit) -> Result<Claim> {
        let target = *self.gate.routes.get(unit).ok_or_else(|| -> anyhow::Error {
            Error::simple("expected a routable unit").into()
        })?;
        let broker = *self
            .gate
            .dispatches
            .get(&target)
            .ok_or_else(|| -> anyhow::Error {
                Error::simple("expected a dispatched target").into()
            })?;
        Ok(Claim {
            unit: unit.clone(),
            broker,
            target,
        })
    }

    /// Re-dispatches a claim to the immediate child holding its target.
    fn forward(&self, claim: &Claim) -> Claim {
        let broker = *self
            .gate
            .dispatches
            .get(&claim.target)
            .expect("the target lies in a child subtree");
        Claim {
            unit: claim.unit.clone(),
            broker,
            target: claim.target,
        }
    }

    fn demand(&mut self, claim: Claim) {
        if self.claim_set.contains(&claim) {
            return;
        }
        self.claim_set.insert(claim.clone());
        self.claims_by_broker
            .entry(claim.broker)
            .or_default()
            .push(claim);
    }

    fn supply(&mut self, claim: Claim, phrase: Phrase) {
        debug_assert!(self.claim_set.contains(&claim));
        debug_assert!(!self.phrase_by_claim.contains_key(&claim));
        self.phrase_by_claim.insert(claim, phrase);
    }

    /// Appoints and assigns claims for all units of the code.
    fn schedule(
        &mut self,
        code: &Rc<Code>,
        dispatcher: Option<&Term>,
        router: Option<&Term>,
    ) -> Result<()> {
        self.push_gate(None, dispatcher, router);
        let result: Result<()> = (|| {
            for unit in code.units() {
                let claim = self.appoint(&unit)?;
                self.demand(claim);
            }
            Ok(())
        })();
        self.pop_gate();
        result
    }

    /// Evaluates a scheduled code into a phrase.
    fn evaluate(
        &mut self,
        code: &Rc<Code>,
        dispatcher: Option<&Term>,
        router: Option<&Term>,
    ) -> Result<Phrase> {
        self.push_gate(None, dispatcher, router);
        let result = self.evaluate_in_gate(code);
        self.pop_gate();
        result
    }

    fn evaluate_in_gate(&mut self, code: &Rc<Code>) -> Result<Phrase> {
        Ok(match &**code {
            Code::Literal { value, domain } => Phrase::literal(value.clone(), domain.clone()),
            Code::Cast { base, domain } => {
                let base = self.evaluate_in_gate(base)?;
                let is_nullable = base.is_nullable;
                Phrase {
                    kind: PhraseKind::Cast {
                        base: Box::new(base),
                    },
                    domain: domain.clone(),
                    is_nullable,
                }
            }
            Code::Correlation { code } => self
                .correlations
                .get(code)
                .cloned()
                .ok_or_else(|| -> anyhow::Error {
                    Error::simple("expected an imported correlation").into()
                })?,
            Code::Formula {
                signature,
                domain,
                arguments,
            } => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.evaluate_in_gate(argument))
                    .collect::<Result<Vec<_>>>()?;
                let is_nullable = match signature {
                    // Total equality and null tests never produce NULL.
                    Signature::IsTotallyEqual { .. } | Signature::IsNull { .. } => false,
                    Signature::NullIf => true,
                    Signature::IfNull => {
                        arguments.iter().all(|argument| argument.is_nullable)
                    }
                    _ => arguments.iter().any(|argument| argument.is_nullable),
                };
                Phrase {
                    kind: PhraseKind::Formula {
                        signature: signature.clone(),
                        arguments,
                    },
                    domain: domain.clone(),
                    is_nullable,
                }
            }
            Code::Unit(unit) => {
                let claim = self.appoint(unit)?;
                self.phrase_by_claim
                    .get(&claim)
                    .cloned()
                    .ok_or_else(|| -> anyhow::Error {
                        Error::simple("expected a satisfied claim").into()
                    })?
            }
        })
    }

    // -- frame assembly --------------------------------------------------

    pub fn assemble(&mut self, term: &Term) -> Result<Frame> {
        let claims = self
            .claims_by_broker
            .get(&term.tag)
            .cloned()
            .unwrap_or_default();
        match &term.kind {
            TermKind::Scalar => {
                // A scalar term exports nothing.
                debug_assert!(claims.is_empty());
                Ok(Frame {
                    tag: term.tag,
                    kind: FrameKind::Scalar,
                })
            }
            TermKind::Table(table) => {
                for claim in claims {
                    debug_assert_eq!(claim.broker, term.tag);
                    debug_assert_eq!(claim.target, term.tag);
                    let Unit::Column { column, .. } = &claim.unit else {
                        return Err(
                            Error::simple("expected a column claim on a table frame").into()
                        );
                    };
                    let entity = self.catalog.column(*column);
                    let is_nullable = entity.is_nullable || self.gate.is_nullable;
                    let phrase = Phrase {
                        kind: PhraseKind::Column {
                            tag: term.tag,
                            column: *column,
                        },
                        domain: entity.domain.clone(),
                        is_nullable,
                    };
                    self.supply(claim, phrase);
                }
                Ok(Frame {
                    tag: term.tag,
                    kind: FrameKind::Table(*table),
                })
            }
            TermKind::Segment { .. } => {
                let frame = self.assemble_segment(term)?;
                Ok(Frame {
                    tag: term.tag,
                    kind: FrameKind::Segment(Box::new(frame)),
                })
            }
            _ => self.assemble_branch(term, claims),
        }
    }

    fn assemble_branch(&mut self, term: &Term, claims: Vec<Claim>) -> Result<Frame> {
        self.delegate(term, &claims)?;
        let include = self.assemble_include(term)?;
        let embed = self.assemble_embed(term)?;
        let select = match &term.kind {
            TermKind::Correlation { .. } => {
                // An embedded frame selects exactly one phrase.
                debug_assert_eq!(claims.len(), 1);
                let claim = claims[0].clone();
                debug_assert_eq!(claim.target, term.tag);
                let code = claim
                    .unit
                    .code()
                    .expect("a correlation claim is compound")
                    .clone();
                let phrase = self.evaluate(&code, None, None)?;
                // Values produced by embedded frames are always nullable.
                let export = Phrase {
                    kind: PhraseKind::Embedding { tag: term.tag },
                    domain: phrase.domain.clone(),
                    is_nullable: true,
                };
                self.supply(claim, export);
                vec![phrase]
            }
            TermKind::Projection { kid, .. } => {
                self.push_gate(None, None, Some(kid));
                let select = self.assemble_select(term, &claims);
                self.pop_gate();
                select?
            }
            _ => self.assemble_select(term, &claims)?,
        };
        let where_ = match &term.kind {
            TermKind::Filter { kid, filter } => {
                Some(self.evaluate(filter, None, Some(kid))?)
            }
            _ => None,
        };
        let group = match &term.kind {
            TermKind::Projection { kid, kernels } => {
                let mut group = Vec::new();
                for code in kernels {
                    // Unit-free kernels cannot affect the projection.
                    if code.units().is_empty() {
                        continue;
                    }
                    group.push(self.evaluate(code, None, Some(kid))?);
                }
                // A scalar projection keeps a placeholder so projection
                // frames stay distinguishable from plain selects.
                if group.is_empty() {
                    group.push(Phrase::true_literal());
                }
                group
            }
            _ => Vec::new(),
        };
        let order = match &term.kind {
            TermKind::Order { kid, order, .. } => {
                let mut phrases = Vec::new();
                for (code, direction) in order {
                    // A unit-free expression cannot affect row order.
                    if code.units().is_empty() {
                        continue;
                    }
                    let phrase = self.evaluate(code, None, Some(kid))?;
                    phrases.push(Phrase {
                        domain: phrase.domain.clone(),
                        is_nullable: phrase.is_nullable,
                        kind: PhraseKind::Formula {
                            signature: Signature::SortDirection {
                                direction: *direction,
                            },
                            arguments: vec![phrase],
                        },
                    });
                }
                phrases
            }
            _ => Vec::new(),
        };
        let (limit, offset) = match &term.kind {
            TermKind::Order { limit, offset, .. } => (*limit, *offset),
            _ => (None, None),
        };
        Ok(Frame {
            tag: term.tag,
            kind: FrameKind::Nested(Box::new(NestedFrame {
                include,
                embed,
                select,
                where_,
                group,
                having: None,
                order,
                is_permanent: matches!(term.kind, TermKind::Permanent { .. }),
                limit,
                offset,
            })),
        })
    }

    /// Reviews the claims assigned to the term: forwards foreign targets
    /// to the right child, dismantles own compound units, and schedules
    /// the clause expressions of the term itself.
    fn delegate(&mut self, term: &Term, claims: &[Claim]) -> Result<()> {
        match &term.kind {
            TermKind::Projection { kid, kernels } => {
                // Aggregate arguments and the kernel are appointed
                // against the child's routing table.
                self.push_gate(None, None, Some(kid));
                let result: Result<()> = (|| {
                    self.delegate_claims(term, claims)?;
                    for code in kernels {
                        self.schedule(code, None, None)?;
                    }
                    Ok(())
                })();
                self.pop_gate();
                result
            }
            TermKind::Correlation { .. } => {
                debug_assert_eq!(claims.len(), 1);
                let code = claims[0]
                    .unit
                    .code()
                    .expect("a correlation claim is compound")
                    .clone();
                self.schedule(&code, None, None)
            }
            _ => {
                self.delegate_claims(term, claims)?;
                match &term.kind {
                    TermKind::Filter { kid, filter } => {
                        self.schedule(filter, None, Some(kid))?;
                    }
                    TermKind::Order { kid, order, .. } => {
                        for (code, _) in order {
                            self.schedule(code, None, Some(kid))?;
                        }
                    }
                    TermKind::Join {
                        lkid, rkid, joints, ..
                    } => {
                        for joint in joints {
                            self.schedule(&joint.lop, None, Some(lkid))?;
                            self.schedule(&joint.rop, None, Some(rkid))?;
                        }
                    }
                    TermKind::Embedding {
                        lkid, correlations, ..
                    } => {
                        for code in correlations {
                            self.schedule(code, None, Some(lkid))?;
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
        }
    }

    fn delegate_claims(&mut self, term: &Term, claims: &[Claim]) -> Result<()> {
        for claim in claims {
            debug_assert_eq!(claim.broker, term.tag);
            if claim.target != term.tag {
                let next_claim = self.forward(claim);
                self.demand(next_claim);
            } else {
                // A claim targeted at a branch frame is always compound:
                // dismantle the unit and claim its sub-units.
                let code = claim
                    .unit
                    .code()
                    .ok_or_else(|| -> anyhow::Error {
                        Error::simple("expected a compound claim").into()
                    })?
                    .clone();
                self.schedule(&code, None, None)?;
            }
        }
        Ok(())
    }

    fn assemble_include(&mut self, term: &Term) -> Result<Vec<Anchor>> {
        Ok(match &term.kind {
            TermKind::Filter { kid, .. }
            | TermKind::Correlation { kid }
            | TermKind::Projection { kid, .. }
            | TermKind::Order { kid, .. }
            | TermKind::Wrapper { kid }
            | TermKind::Permanent { kid }
            | TermKind::Segment { kid, .. } => {
                self.push_gate(Some(false), Some(kid), None);
                let frame = self.assemble(kid);
                self.pop_gate();
                vec![Anchor::leading(frame?)]
            }
            TermKind::Join {
                lkid,
                rkid,
                joints,
                is_left,
                is_right,
            } => {
                self.push_gate(Some(*is_right), Some(lkid), None);
                let lframe = self.assemble(lkid);
                self.pop_gate();
                let lanchor = Anchor::leading(lframe?);
                self.push_gate(Some(*is_left), Some(rkid), None);
                let rframe = self.assemble(rkid);
                self.pop_gate();
                let rframe = rframe?;
                // The join condition is a conjunction of joint
                // equalities.
                let mut equalities = Vec::new();
                for joint in joints {
                    let lop = self.evaluate(&joint.lop, None, Some(lkid))?;
                    let rop = self.evaluate(&joint.rop, None, Some(rkid))?;
                    let is_nullable = lop.is_nullable || rop.is_nullable;
                    equalities.push(Phrase {
                        kind: PhraseKind::Formula {
                            signature: Signature::IsEqual {
                                polarity: Polarity::Positive,
                            },
                            arguments: vec![lop, rop],
                        },
                        domain: Domain::Boolean,
                        is_nullable,
                    });
                }
                let condition = if !equalities.is_empty() {
                    let is_nullable = equalities.iter().any(|equality| equality.is_nullable);
                    Some(if equalities.len() == 1 {
                        equalities.pop().unwrap()
                    } else {
                        Phrase {
                            kind: PhraseKind::Formula {
                                signature: Signature::And,
                                arguments: equalities,
                            },
                            domain: Domain::Boolean,
                            is_nullable,
                        }
                    })
                } else if *is_left || *is_right {
                    Some(Phrase::true_literal())
                } else {
                    None
                };
                let ranchor = Anchor {
                    frame: rframe,
                    condition,
                    is_left: *is_left,
                    is_right: *is_right,
                };
                vec![lanchor, ranchor]
            }
            TermKind::Embedding { lkid, .. } => {
                // Only the main child contributes to the FROM list.
                self.push_gate(Some(false), Some(lkid), None);
                let frame = self.assemble(lkid);
                self.pop_gate();
                vec![Anchor::leading(frame?)]
            }
            TermKind::Scalar | TermKind::Table(_) => Vec::new(),
        })
    }

    fn assemble_embed(&mut self, term: &Term) -> Result<Vec<Frame>> {
        let TermKind::Embedding {
            lkid,
            rkid,
            correlations,
        } = &term.kind
        else {
            return Ok(Vec::new());
        };
        // Make the correlated phrases of the main child available to the
        // embedded frame.
        let mut imported = HashMap::new();
        for code in correlations {
            let phrase = self.evaluate(code, None, Some(lkid))?;
            imported.insert(code.clone(), phrase);
        }
        self.push_correlations(imported);
        // An embedded frame is treated as nullable.
        self.push_gate(Some(true), Some(rkid), None);
        let frame = self.assemble(rkid);
        self.pop_gate();
        self.pop_correlations();
        Ok(vec![frame?])
    }

    fn assemble_select(&mut self, term: &Term, claims: &[Claim]) -> Result<Vec<Phrase>> {
        let mut select: Vec<Phrase> = Vec::new();
        let mut index_by_phrase: HashMap<Phrase, usize> = HashMap::new();
        for claim in claims {
            let phrase = if claim.target != term.tag {
                let next_claim = self.forward(claim);
                self.phrase_by_claim
                    .get(&next_claim)
                    .cloned()
                    .ok_or_else(|| -> anyhow::Error {
                        Error::simple("expected a satisfied forward claim").into()
                    })?
            } else {
                let code = claim
                    .unit
                    .code()
                    .expect("a branch claim is compound")
                    .clone();
                self.evaluate(&code, None, None)?
            };
            // Different claims may produce identical phrases.
            let index = match index_by_phrase.get(&phrase) {
                Some(index) => *index,
                None => {
                    let index = select.len();
                    select.push(phrase.clone());
                    index_by_phrase.insert(phrase.clone(), index);
                    index
                }
            };
            let is_nullable = phrase.is_nullable || self.gate.is_nullable;
            let reference = Phrase {
                kind: PhraseKind::Reference {
                    tag: term.tag,
                    index,
                },
                domain: phrase.domain.clone(),
                is_nullable,
            };
            self.supply(claim.clone(), reference);
        }
        // SQL forbids an empty SELECT list.
        if select.is_empty() {
            select.push(Phrase::true_literal());
        }
        Ok(select)
    }

    // -- segments --------------------------------------------------------

    fn assemble_segment(&mut self, term: &Term) -> Result<SegmentFrame> {
        let TermKind::Segment {
            codes,
            superkeys,
            keys,
            order,
            dependents,
            ..
        } = &term.kind
        else {
            unreachable!();
        };
        // The top frame of a tree receives no claims.
        debug_assert!(self
            .claims_by_broker
            .get(&term.tag)
            .map_or(true, |claims| claims.is_empty()));
        for code in codes {
            self.schedule(code, None, None)?;
        }
        for code in superkeys {
            self.schedule(code, None, None)?;
        }
        if !dependents.is_empty() {
            for code in keys {
                self.schedule(code, None, None)?;
            }
        }
        for (code, _) in order {
            self.schedule(code, None, None)?;
        }

        let include = self.assemble_include(term)?;
        let embed = self.assemble_embed(term)?;

        // The SELECT list: output codes, then merge keys, deduplicated;
        // constant codes are produced by value pipes instead.
        let mut all_codes: Vec<Rc<Code>> = codes.clone();
        all_codes.extend(superkeys.iter().cloned());
        if !dependents.is_empty() {
            all_codes.extend(keys.iter().cloned());
        }
        let mut select: Vec<Phrase> = Vec::new();
        let mut index_by_phrase: HashMap<Phrase, usize> = HashMap::new();
        let mut index_by_code: HashMap<Rc<Code>, usize> = HashMap::new();
        for code in &all_codes {
            if is_constant(code) {
                continue;
            }
            let phrase = self.evaluate(code, None, None)?;
            let index = match index_by_phrase.get(&phrase) {
                Some(index) => *index,
                None => {
                    let index = select.len();
                    select.push(phrase.clone());
                    index_by_phrase.insert(phrase.clone(), index);
                    index
                }
            };
            index_by_code.insert(code.clone(), index);
        }
        if select.is_empty() {
            select.push(Phrase::true_literal());
        }
        let domains: Vec<Domain> = select.iter().map(|phrase| phrase.domain.clone()).collect();

        // The segment orders its own rows; nested segment merging
        // depends on it.
        let mut order_phrases = Vec::new();
        for (code, direction) in order {
            if code.units().is_empty() {
                continue;
            }
            let phrase = self.evaluate(code, None, None)?;
            order_phrases.push(Phrase {
                domain: phrase.domain.clone(),
                is_nullable: phrase.is_nullable,
                kind: PhraseKind::Formula {
                    signature: Signature::SortDirection {
                        direction: *direction,
                    },
                    arguments: vec![phrase],
                },
            });
        }

        // Dependent segment trees assemble in their own claim scope.
        let mut assembled: Vec<SegmentFrame> = Vec::new();
        let mut index_by_term: HashMap<*const Term, isize> = HashMap::new();
        for subterm in dependents {
            let key = Rc::as_ptr(subterm);
            if index_by_term.contains_key(&key) {
                continue;
            }
            self.set_tree(subterm);
            let frame = self.assemble(subterm)?;
            let Frame {
                kind: FrameKind::Segment(segment),
                ..
            } = frame
            else {
                return Err(Error::simple("expected a segment frame").into());
            };
            index_by_term.insert(key, assembled.len() as isize);
            assembled.push(*segment);
        }
        // Mixed rows carry the child lists at the end; address them from
        // the end so the row width does not matter.
        let total = assembled.len() as isize;
        let dependent_pipes: Vec<Pipe> = dependents
            .iter()
            .map(|subterm| {
                let index = index_by_term[&Rc::as_ptr(subterm)];
                Pipe::Extract(index - total)
            })
            .collect();

        let code_pipes: Vec<Pipe> = codes.iter().map(|code| extract_pipe(code, &index_by_code)).collect();
        let superkey_pipes: Vec<Pipe> = superkeys
            .iter()
            .map(|code| extract_pipe(code, &index_by_code))
            .collect();
        let superkey_pipe = key_pipe_of(superkey_pipes);
        let key_pipes: Vec<Pipe> = if !dependents.is_empty() {
            keys.iter()
                .map(|code| extract_pipe(code, &index_by_code))
                .collect()
        } else {
            Vec::new()
        };
        let key_pipe = key_pipe_of(key_pipes);

        Ok(SegmentFrame {
            tag: term.tag,
            nested: NestedFrame {
                include,
                embed,
                select,
                where_: None,
                group: Vec::new(),
                having: None,
                order: order_phrases,
                limit: None,
                offset: None,
                is_permanent: false,
            },
            code_pipes,
            dependent_pipes,
            superkey_pipe,
            key_pipe,
            dependents: assembled,
            domains,
        })
    }
}

/// Constant codes never enter the SELECT list; their values are
/// produced directly by the shaping pipes.
fn is_constant(code: &Rc<Code>) -> bool {
    matches!(
        &**code,
        Code::Literal {
            domain: Domain::Untyped | Domain::Boolean,
            ..
        }
    )
}

fn extract_pipe(code: &Rc<Code>, index_by_code: &HashMap<Rc<Code>, usize>) -> Pipe {
    if let Code::Literal { value, .. } = &**code {
        if is_constant(code) {
            return Pipe::Value(crate::domain::Data::Value(value.clone()));
        }
    }
    Pipe::Extract(index_by_code[code] as isize)
}

fn key_pipe_of(mut pipes: Vec<Pipe>) -> Pipe {
    match pipes.len() {
        0 => Pipe::Value(crate::domain::Data::Value(Value::Boolean(true))),
        1 => pipes.pop().unwrap(),
        _ => Pipe::Record(pipes),
    }
}

/// Translates a compiled segment term into a segment frame.
pub fn assemble(term: &Term, catalog: &Catalog) -> Result<SegmentFrame> {
    log::debug!("assembling frames");
    let mut state = AssemblingState::new(catalog);
    state.set_tree(term);
    let frame = state.assemble(term)?;
    match frame.kind {
        FrameKind::Segment(segment) => Ok(*segment),
        _ => Err(Error::simple("expected a segment frame").into()),
    }
}
