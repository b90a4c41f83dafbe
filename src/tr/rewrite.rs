//! Space+Code rewriting.
//!
//! Four sub-passes share one state:
//!
//! 1. *rewrite* — local algebraic simplification: `?true` filters drop,
//!    attach filter conjuncts of the shape `base-side = seed-side`
//!    become images, string search lowers to `LIKE`, `head`/`tail`/
//!    `slice`/`at` lower to `SUBSTRING`, `length` wraps in `coalesce`.
//! 2. *unmask* — prunes operations already enforced by the dominant
//!    mask space.
//! 3. *collect* — gathers every unit reachable from the segment.
//! 4. *recombine* — groups collected units into batches that can share a
//!    frame, annotating them with companion hints.
//!
//! Then *replace* walks the tree substituting the recombined units.

use std::collections::HashMap;
use std::rc::Rc;

use itertools::Itertools;

use crate::catalog::Catalog;
use crate::domain::{Domain, Value};
use crate::error::{Error, Result};
use crate::tr::signature::{Polarity, Signature};
use crate::tr::space::{Code, SegmentExpr, Space, SpaceKind, Unit};
use crate::tr::stitch::undirect_column;

pub struct RewritingState<'a> {
    catalog: &'a Catalog,
    root: Rc<Space>,
    mask: Rc<Space>,
    mask_stack: Vec<Rc<Space>>,
    collection: Vec<Unit>,
    rewrite_space_cache: HashMap<Rc<Space>, Rc<Space>>,
    rewrite_code_cache: HashMap<Rc<Code>, Rc<Code>>,
    replace_space_cache: HashMap<Rc<Space>, Rc<Space>>,
    replace_code_cache: HashMap<Rc<Code>, Rc<Code>>,
}

impl<'a> RewritingState<'a> {
    pub fn new(catalog: &'a Catalog) -> RewritingState<'a> {
        let root = Space::root();
        RewritingState {
            catalog,
            mask: root.clone(),
            root,
            mask_stack: Vec::new(),
            collection: Vec::new(),
            rewrite_space_cache: HashMap::new(),
            rewrite_code_cache: HashMap::new(),
            replace_space_cache: HashMap::new(),
            replace_code_cache: HashMap::new(),
        }
    }

    /// An empty copy of the state used for recombining subtrees.
    fn spawn(&self) -> RewritingState<'a> {
        RewritingState::new(self.catalog)
    }

    fn push_mask(&mut self, mask: Rc<Space>) {
        self.mask_stack.push(std::mem::replace(&mut self.mask, mask));
    }

    fn pop_mask(&mut self) {
        self.mask = self.mask_stack.pop().expect("unbalanced mask stack");
    }

    fn memorize_unit(&mut self, unit: &Unit, replacement: Unit) {
        let key = unit.clone().into_code();
        debug_assert!(!self.replace_code_cache.contains_key(&key));
        self.replace_code_cache.insert(key, replacement.into_code());
    }

    fn memorize_space(&mut self, space: &Rc<Space>, replacement: Rc<Space>) {
        debug_assert!(!self.replace_space_cache.contains_key(space));
        self.replace_space_cache.insert(space.clone(), replacement);
    }

    // -- rewrite ---------------------------------------------------------

    pub fn rewrite_segment(&mut self, segment: &SegmentExpr) -> Result<Rc<SegmentExpr>> {
        let root = self.rewrite_space(&segment.root)?;
        let space = self.rewrite_space(&segment.space)?;
        let codes = segment
            .codes
            .iter()
            .map(|code| self.rewrite_code(code))
            .collect::<Result<Vec<_>>>()?;
        let dependents = segment
            .dependents
            .iter()
            .map(|dependent| self.rewrite_segment(dependent))
            .collect::<Result<Vec<_>>>()?;
        Ok(Rc::new(SegmentExpr {
            root,
            space,
            codes,
            dependents,
            flow: segment.flow.clone(),
        }))
    }

    pub fn rewrite_space(&mut self, space: &Rc<Space>) -> Result<Rc<Space>> {
        if let Some(cached) = self.rewrite_space_cache.get(space) {
            return Ok(cached.clone());
        }
        let replacement = self.rewrite_space_uncached(space)?;
        self.rewrite_space_cache
            .insert(space.clone(), replacement.clone());
        Ok(replacement)
    }

    fn rewrite_space_uncached(&mut self, space: &Rc<Space>) -> Result<Rc<Space>> {
        let Some(base) = &space.base else {
            return Ok(space.clone());
        };
        let base = self.rewrite_space(base)?;
        match &space.kind {
            SpaceKind::Quotient {
                seed,
                kernels,
                companions,
                ..
            } => {
                let seed = self.rewrite_space(seed)?;
                let kernels = kernels
                    .iter()
                    .map(|code| self.rewrite_code(code))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Space::quotient_with(base, seed, kernels, companions.clone()))
            }
            SpaceKind::Moniker {
                seed, companions, ..
            } => {
                let seed = self.rewrite_space(seed)?;
                Ok(Space::moniker(base, seed, companions.clone()))
            }
            SpaceKind::Clipped {
                seed,
                limit,
                offset,
                companions,
                ..
            } => {
                let seed = self.rewrite_space(seed)?;
                Ok(Space::clipped(base, seed, *limit, *offset, companions.clone()))
            }
            SpaceKind::Forked {
                seed,
                kernels,
                companions,
                ..
            } => {
                let seed = self.rewrite_space(seed)?;
                let kernels = kernels
                    .iter()
                    .map(|code| self.rewrite_code(code))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Space::forked(base, seed, kernels, companions.clone()))
            }
            SpaceKind::Attach { .. } | SpaceKind::Locator { .. } => {
                self.rewrite_attach(space, base)
            }
            SpaceKind::Filtered { filter } => {
                let filter = self.rewrite_code(filter)?;
                // A `?true` filter is a no-op.
                if matches!(
                    &*filter,
                    Code::Literal {
                        value: Value::Boolean(true),
                        domain: Domain::Boolean,
                    }
                ) {
                    return Ok(base);
                }
                Ok(Space::filtered(base, filter))
            }
            SpaceKind::Ordered {
                order,
                limit,
                offset,
            } => {
                let order = order
                    .iter()
                    .map(|(code, direction)| Ok((self.rewrite_code(code)?, *direction)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Space::ordered(base, order, *limit, *offset))
            }
            _ => Ok(space.clone_with_base(Some(base))),
        }
    }

    /// Collapses attach filter conjuncts of the shape
    /// `base-side = seed-side` into fiber images.
    fn rewrite_attach(&mut self, space: &Rc<Space>, base: Rc<Space>) -> Result<Rc<Space>> {
        let (seed, images, filter, companions, is_locator) = match &space.kind {
            SpaceKind::Attach {
                seed,
                images,
                filter,
                companions,
                ..
            } => (seed, images, filter, companions, false),
            SpaceKind::Locator {
                seed,
                images,
                filter,
                companions,
                ..
            } => (seed, images, filter, companions, true),
            _ => unreachable!(),
        };
        let seed = self.rewrite_space(seed)?;
        let all_images = images
            .iter()
            .map(|(lop, rop)| Ok((self.rewrite_code(lop)?, self.rewrite_code(rop)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut filter = match filter {
            None => None,
            Some(filter) => {
                let filter = self.rewrite_code(filter)?;
                if matches!(
                    &*filter,
                    Code::Literal {
                        value: Value::Boolean(true),
                        ..
                    }
                ) {
                    None
                } else {
                    Some(filter)
                }
            }
        };
        let mut predicates: Vec<Rc<Code>> = Vec::new();
        let mut images: Vec<(Rc<Code>, Rc<Code>)> = Vec::new();
        // An image whose base side carries no units is really a filter.
        for (lop, rop) in all_images {
            if lop.units().is_empty() {
                predicates.push(Code::formula(
                    Signature::IsEqual {
                        polarity: Polarity::Positive,
                    },
                    Domain::Boolean,
                    vec![rop, lop],
                ));
            } else {
                images.push((lop, rop));
            }
        }
        if let Some(condition) = filter.take() {
            let ops = match &*condition {
                Code::Formula {
                    signature: Signature::And,
                    arguments,
                    ..
                } => arguments.clone(),
                _ => vec![condition],
            };
            for op in ops {
                if let Code::Formula {
                    signature:
                        Signature::IsEqual {
                            polarity: Polarity::Positive,
                        },
                    arguments,
                    ..
                } = &*op
                {
                    let (lop, rop) = (&arguments[0], &arguments[1]);
                    let lop_units = lop.units();
                    let rop_units = rop.units();
                    if !lop_units.is_empty()
                        && lop_units.iter().all(|unit| base.spans(unit.space()))
                        && rop_units.iter().any(|unit| !base.spans(unit.space()))
                    {
                        images.push((lop.clone(), rop.clone()));
                        continue;
                    }
                    if !rop_units.is_empty()
                        && rop_units.iter().all(|unit| base.spans(unit.space()))
                        && lop_units.iter().any(|unit| !base.spans(unit.space()))
                    {
                        images.push((rop.clone(), lop.clone()));
                        continue;
                    }
                }
                predicates.push(op);
            }
        }
        let filter = if predicates.is_empty() {
            None
        } else {
            Some(Code::conjoin(predicates))
        };
        Ok(if is_locator {
            Space::locator(base, seed, images, filter, companions.clone())
        } else {
            Space::attach(base, seed, images, filter, companions.clone())
        })
    }

    pub fn rewrite_code(&mut self, code: &Rc<Code>) -> Result<Rc<Code>> {
        if let Some(cached) = self.rewrite_code_cache.get(code) {
            return Ok(cached.clone());
        }
        let replacement = self.rewrite_code_uncached(code)?;
        self.rewrite_code_cache
            .insert(code.clone(), replacement.clone());
        Ok(replacement)
    }

    fn rewrite_code_uncached(&mut self, code: &Rc<Code>) -> Result<Rc<Code>> {
        match &**code {
            Code::Literal { .. } | Code::Correlation { .. } => Ok(code.clone()),
            Code::Cast { base, domain } => {
                let base = self.rewrite_code(base)?;
                Ok(Rc::new(Code::Cast {
                    base,
                    domain: domain.clone(),
                }))
            }
            Code::Formula {
                signature,
                domain,
                arguments,
            } => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.rewrite_code(argument))
                    .collect::<Result<Vec<_>>>()?;
                Ok(rewrite_by_signature(signature, domain, arguments))
            }
            Code::Unit(unit) => Ok(self.rewrite_unit(unit)?.into_code()),
        }
    }

    fn rewrite_unit(&mut self, unit: &Unit) -> Result<Unit> {
        Ok(match unit {
            Unit::Column {
                column,
                space,
                domain,
            } => Unit::Column {
                column: *column,
                space: self.rewrite_space(space)?,
                domain: domain.clone(),
            },
            Unit::Scalar {
                code,
                space,
                companions,
            } => Unit::Scalar {
                code: self.rewrite_code(code)?,
                space: self.rewrite_space(space)?,
                companions: companions.clone(),
            },
            Unit::Aggregate {
                code,
                plural_space,
                space,
                companions,
            } => Unit::Aggregate {
                code: self.rewrite_code(code)?,
                plural_space: self.rewrite_space(plural_space)?,
                space: self.rewrite_space(space)?,
                companions: companions.clone(),
            },
            Unit::Correlated {
                code,
                plural_space,
                space,
            } => Unit::Correlated {
                code: self.rewrite_code(code)?,
                plural_space: self.rewrite_space(plural_space)?,
                space: self.rewrite_space(space)?,
            },
            Unit::Kernel { code, space } => {
                // The kernel code is an element of the quotient kernel;
                // track it by position through the rewrite.
                let index = space
                    .quotient_kernels()
                    .iter()
                    .position(|kernel| kernel == code)
                    .expect("a kernel unit refers to its quotient kernel");
                let space = self.rewrite_space(space)?;
                let code = space.quotient_kernels()[index].clone();
                Unit::Kernel { code, space }
            }
            Unit::Covering { code, space } => Unit::Covering {
                code: self.rewrite_code(code)?,
                space: self.rewrite_space(space)?,
            },
        })
    }

    // -- unmask ----------------------------------------------------------

    pub fn unmask_segment(
        &mut self,
        segment: &SegmentExpr,
        mask: Option<Rc<Space>>,
    ) -> Result<Rc<SegmentExpr>> {
        match mask {
            Some(mask) => {
                self.push_mask(mask);
                let result = self.unmask_segment_unguarded(segment);
                self.pop_mask();
                result
            }
            None => self.unmask_segment_unguarded(segment),
        }
    }

    fn unmask_segment_unguarded(&mut self, segment: &SegmentExpr) -> Result<Rc<SegmentExpr>> {
        let codes = segment
            .codes
            .iter()
            .map(|code| self.unmask_code_with(code, Some(segment.space.clone())))
            .collect::<Result<Vec<_>>>()?;
        let dependents = segment
            .dependents
            .iter()
            .map(|dependent| {
                self.push_mask(segment.space.clone());
                let result = self.unmask_segment_unguarded(dependent);
                self.pop_mask();
                result
            })
            .collect::<Result<Vec<_>>>()?;
        let space = self.unmask_space_with(&segment.space, Some(segment.root.clone()))?;
        let root = self.unmask_space(&segment.root)?;
        Ok(Rc::new(SegmentExpr {
            root,
            space,
            codes,
            dependents,
            flow: segment.flow.clone(),
        }))
    }

    pub fn unmask_space_with(
        &mut self,
        space: &Rc<Space>,
        mask: Option<Rc<Space>>,
    ) -> Result<Rc<Space>> {
        match mask {
            Some(mask) => {
                self.push_mask(mask);
                let result = self.unmask_space(space);
                self.pop_mask();
                result
            }
            None => self.unmask_space(space),
        }
    }

    pub fn unmask_space(&mut self, space: &Rc<Space>) -> Result<Rc<Space>> {
        let Some(base) = &space.base else {
            return Ok(space.clone());
        };
        match &space.kind {
            SpaceKind::Quotient {
                seed,
                kernels,
                companions,
                ..
            } => {
                // Unmask the kernel against the seed space.
                let kernels = kernels
                    .iter()
                    .map(|code| self.unmask_code_with(code, Some(seed.clone())))
                    .collect::<Result<Vec<_>>>()?;
                // Only now can a scalar kernel be detected: unmasking may
                // have removed phantom units.
                if kernels.iter().all(|code| code.units().is_empty()) {
                    return Err(Error::simple("found an empty or constant kernel").into());
                }
                let seed = self.unmask_space_with(seed, Some(base.clone()))?;
                let base = self.unmask_space(base)?;
                Ok(Space::quotient_with(base, seed, kernels, companions.clone()))
            }
            SpaceKind::Moniker {
                seed, companions, ..
            } => {
                let seed = self.unmask_space_with(seed, Some(base.clone()))?;
                let base = self.unmask_space(base)?;
                Ok(Space::moniker(base, seed, companions.clone()))
            }
            SpaceKind::Clipped {
                seed,
                limit,
                offset,
                companions,
                ..
            } => {
                let seed = self.unmask_space_with(seed, Some(base.clone()))?;
                let base = self.unmask_space(base)?;
                Ok(Space::clipped(base, seed, *limit, *offset, companions.clone()))
            }
            SpaceKind::Forked {
                seed,
                ground,
                kernels,
                companions,
            } => {
                // Keep only the trailing non-axial operations of the seed.
                let seed = self.unmask_space_with(seed, Some(ground.clone()))?;
                let kernels = kernels
                    .iter()
                    .map(|code| self.unmask_code_with(code, Some(base.clone())))
                    .collect::<Result<Vec<_>>>()?;
                let base = self.unmask_space(base)?;
                Ok(Space::forked(base, seed, kernels, companions.clone()))
            }
            SpaceKind::Attach {
                seed,
                images,
                filter,
                companions,
                ..
            } => {
                let unmasked = self.unmask_attach(base, seed, images, filter)?;
                let (base, seed, images, filter) = unmasked;
                Ok(Space::attach(base, seed, images, filter, companions.clone()))
            }
            SpaceKind::Locator {
                seed,
                images,
                filter,
                companions,
                ..
            } => {
                let unmasked = self.unmask_attach(base, seed, images, filter)?;
                let (base, seed, images, filter) = unmasked;
                Ok(Space::locator(base, seed, images, filter, companions.clone()))
            }
            SpaceKind::Filtered { filter } => {
                // A filter already enforced by the mask is elided.
                if space.prune(&self.mask) == base.prune(&self.mask) {
                    return self.unmask_space(base);
                }
                let filter = if base.dominates(&self.mask) {
                    self.unmask_code(filter)?
                } else {
                    self.unmask_code_with(filter, Some(base.clone()))?
                };
                let base = self.unmask_space(base)?;
                Ok(Space::filtered(base, filter))
            }
            SpaceKind::Ordered {
                order,
                limit,
                offset,
            } => {
                if space.prune(&self.mask) == base.prune(&self.mask) {
                    return self.unmask_space(base);
                }
                let order = if base.dominates(&self.mask) {
                    order
                        .iter()
                        .map(|(code, direction)| Ok((self.unmask_code(code)?, *direction)))
                        .collect::<Result<Vec<_>>>()?
                } else {
                    order
                        .iter()
                        .map(|(code, direction)| {
                            Ok((self.unmask_code_with(code, Some(base.clone()))?, *direction))
                        })
                        .collect::<Result<Vec<_>>>()?
                };
                // Slicing relies on the exact base rows: reset the mask to
                // the root while unmasking the base.
                let base = if space.is_expanding {
                    self.unmask_space(base)?
                } else {
                    self.unmask_space_with(base, Some(self.root.clone()))?
                };
                Ok(Space::ordered(base, order, *limit, *offset))
            }
            _ => {
                let base = self.unmask_space(base)?;
                Ok(space.clone_with_base(Some(base)))
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn unmask_attach(
        &mut self,
        base: &Rc<Space>,
        seed: &Rc<Space>,
        images: &[(Rc<Code>, Rc<Code>)],
        filter: &Option<Rc<Code>>,
    ) -> Result<(
        Rc<Space>,
        Rc<Space>,
        Vec<(Rc<Code>, Rc<Code>)>,
        Option<Rc<Code>>,
    )> {
        let unmasked_base = self.unmask_space(base)?;
        let unmasked_seed = self.unmask_space_with(seed, Some(base.clone()))?;
        let images = images
            .iter()
            .map(|(lop, rop)| {
                Ok((
                    self.unmask_code_with(lop, Some(base.clone()))?,
                    self.unmask_code_with(rop, Some(seed.clone()))?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let filter = filter
            .as_ref()
            .map(|filter| self.unmask_code_with(filter, Some(seed.clone())))
            .transpose()?;
        Ok((unmasked_base, unmasked_seed, images, filter))
    }

    pub fn unmask_code_with(
        &mut self,
        code: &Rc<Code>,
        mask: Option<Rc<Space>>,
    ) -> Result<Rc<Code>> {
        match mask {
            Some(mask) => {
                self.push_mask(mask);
                let result = self.unmask_code(code);
                self.pop_mask();
                result
            }
            None => self.unmask_code(code),
        }
    }

    pub fn unmask_code(&mut self, code: &Rc<Code>) -> Result<Rc<Code>> {
        match &**code {
            Code::Literal { .. } | Code::Correlation { .. } => Ok(code.clone()),
            Code::Cast { base, domain } => {
                let base = self.unmask_code(base)?;
                Ok(Rc::new(Code::Cast {
                    base,
                    domain: domain.clone(),
                }))
            }
            Code::Formula {
                signature,
                domain,
                arguments,
            } => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.unmask_code(argument))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Code::formula(signature.clone(), domain.clone(), arguments))
            }
            Code::Unit(unit) => self.unmask_unit(unit),
        }
    }

    fn unmask_unit(&mut self, unit: &Unit) -> Result<Rc<Code>> {
        Ok(match unit {
            Unit::Column {
                column,
                space,
                domain,
            } => {
                let space = self.unmask_space(space)?;
                // Redirect across one-to-one direct joins whose target
                // column is the unit column.
                let (space, column) = undirect_column(space, *column);
                Unit::Column {
                    column,
                    space,
                    domain: domain.clone(),
                }
                .into_code()
            }
            Unit::Scalar {
                code,
                space,
                companions,
            } => {
                // The unit is redundant when its space dominates the mask.
                if space.dominates(&self.mask) {
                    return self.unmask_code(code);
                }
                // Or when the operand is a unit under a dominated space.
                if let Code::Unit(inner) = &**code {
                    if space.dominates(inner.space()) {
                        return self.unmask_code(code);
                    }
                }
                let code = self.unmask_code_with(code, Some(space.clone()))?;
                let space = self.unmask_space(space)?;
                Unit::Scalar {
                    code,
                    space,
                    companions: companions.clone(),
                }
                .into_code()
            }
            Unit::Aggregate {
                code,
                plural_space,
                space,
                companions,
            } => {
                let code = self.unmask_code_with(code, Some(plural_space.clone()))?;
                let plural_space = if space.dominates(&self.mask) {
                    self.unmask_space(plural_space)?
                } else {
                    self.unmask_space_with(plural_space, Some(space.clone()))?
                };
                let space = self.unmask_space(space)?;
                Unit::Aggregate {
                    code,
                    plural_space,
                    space,
                    companions: companions.clone(),
                }
                .into_code()
            }
            Unit::Correlated {
                code,
                plural_space,
                space,
            } => {
                let code = self.unmask_code_with(code, Some(plural_space.clone()))?;
                let plural_space = if space.dominates(&self.mask) {
                    self.unmask_space(plural_space)?
                } else {
                    self.unmask_space_with(plural_space, Some(space.clone()))?
                };
                let space = self.unmask_space(space)?;
                Unit::Correlated {
                    code,
                    plural_space,
                    space,
                }
                .into_code()
            }
            Unit::Kernel { code, space } => {
                let index = space
                    .quotient_kernels()
                    .iter()
                    .position(|kernel| kernel == code)
                    .expect("a kernel unit refers to its quotient kernel");
                let space = self.unmask_space(space)?;
                let code = space.quotient_kernels()[index].clone();
                Unit::Kernel { code, space }.into_code()
            }
            Unit::Covering { code, space } => {
                let seed = space.seed().expect("a covering space has a seed").clone();
                let code = self.unmask_code_with(code, Some(seed))?;
                let space = self.unmask_space(space)?;
                Unit::Covering { code, space }.into_code()
            }
        })
    }

    // -- collect ---------------------------------------------------------

    pub fn collect_space(&mut self, space: &Rc<Space>) {
        let Some(base) = &space.base else {
            return;
        };
        match &space.kind {
            SpaceKind::Forked { kernels, .. } => {
                // The seed duplicates the parent space; only the kernel
                // contributes units.
                self.collect_space(&base.clone());
                for code in kernels.clone() {
                    self.collect_code(&code);
                }
            }
            SpaceKind::Attach { images, .. } | SpaceKind::Locator { images, .. } => {
                self.collect_space(&base.clone());
                for (lop, _) in images.clone() {
                    self.collect_code(&lop);
                }
            }
            SpaceKind::Filtered { filter } => {
                self.collect_space(&base.clone());
                self.collect_code(&filter.clone());
            }
            SpaceKind::Ordered { order, .. } => {
                self.collect_space(&base.clone());
                for (code, _) in order.clone() {
                    self.collect_code(&code);
                }
            }
            _ => self.collect_space(&base.clone()),
        }
    }

    pub fn collect_code(&mut self, code: &Rc<Code>) {
        // Child nodes of each unit are recombined against a blank state
        // in replace, so collection does not descend into them.
        self.collection.extend(code.units());
    }

    // -- recombine -------------------------------------------------------

    pub fn recombine(&mut self) -> Result<()> {
        self.recombine_scalars()?;
        self.recombine_aggregates()
    }

    fn recombine_scalars(&mut self) -> Result<()> {
        let mut duplicates = std::collections::HashSet::new();
        let mut spaces = Vec::new();
        let mut units_by_space: HashMap<Rc<Space>, Vec<Unit>> = HashMap::new();
        for unit in self.collection.clone() {
            if !matches!(unit, Unit::Scalar { .. }) {
                continue;
            }
            if duplicates.contains(&unit) {
                continue;
            }
            duplicates.insert(unit.clone());
            let space = unit.space().clone();
            if !units_by_space.contains_key(&space) {
                spaces.push(space.clone());
            }
            units_by_space.entry(space).or_default().push(unit);
        }
        for space in spaces {
            let units = units_by_space.remove(&space).unwrap();
            self.recombine_scalar_batch(&space, &units)?;
        }
        Ok(())
    }

    fn recombine_aggregates(&mut self) -> Result<()> {
        let mut duplicates = std::collections::HashSet::new();
        let mut pairs = Vec::new();
        let mut units_by_pair: HashMap<(Rc<Space>, Rc<Space>), Vec<Unit>> = HashMap::new();
        for unit in self.collection.clone() {
            let Unit::Aggregate {
                plural_space,
                space,
                ..
            } = &unit
            else {
                continue;
            };
            if duplicates.contains(&unit) {
                continue;
            }
            duplicates.insert(unit.clone());
            // Aggregates whose plural spaces differ only by filtering can
            // still share a frame; strip the filters for grouping.
            let mut stripped = plural_space.clone();
            while let SpaceKind::Filtered { .. } = &stripped.kind {
                stripped = stripped.base.clone().expect("a filter has a base");
            }
            let pair = (stripped, space.clone());
            if !units_by_pair.contains_key(&pair) {
                pairs.push(pair.clone());
            }
            units_by_pair.entry(pair).or_default().push(unit);
        }
        for pair in pairs {
            let units = units_by_pair.remove(&pair).unwrap();
            self.recombine_aggregate_batch(&pair.0, &pair.1, &units)?;
        }
        Ok(())
    }

    fn recombine_scalar_batch(&mut self, space: &Rc<Space>, units: &[Unit]) -> Result<()> {
        if units.len() <= 1 {
            return Ok(());
        }
        let codes: Vec<Rc<Code>> = units
            .iter()
            .map(|unit| unit.code().expect("a scalar unit has a code").clone())
            .collect();
        let mut substate = self.spawn();
        substate.collect_space(space);
        for code in &codes {
            substate.collect_code(code);
        }
        substate.recombine()?;
        let space = substate.replace_space(space)?;
        let codes = codes
            .iter()
            .map(|code| substate.replace_code(code))
            .collect::<Result<Vec<_>>>()?;
        for (idx, unit) in units.iter().enumerate() {
            let code = codes[idx].clone();
            let companions = codes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, code)| code.clone())
                .collect_vec();
            let replacement = Unit::Scalar {
                code,
                space: space.clone(),
                companions,
            };
            self.memorize_unit(unit, replacement);
        }
        Ok(())
    }

    fn recombine_aggregate_batch(
        &mut self,
        plural_space: &Rc<Space>,
        space: &Rc<Space>,
        units: &[Unit],
    ) -> Result<()> {
        // Aggregates over the complement of their own quotient can be
        // embedded into the quotient frame.
        let is_quotient = matches!(space.kind, SpaceKind::Quotient { .. })
            && matches!(plural_space.kind, SpaceKind::Complement { .. })
            && plural_space.base.as_deref() == Some(space.as_ref());
        if units.len() <= 1 && !is_quotient {
            return Ok(());
        }

        let base_space = space;

        // Find the longest common filtered ancestor of the plural spaces.
        let filtered_chain = |space: &Rc<Space>| {
            let mut chain = vec![space.clone()];
            let mut current = space.clone();
            while let SpaceKind::Filtered { .. } = &current.kind {
                current = current.base.clone().expect("a filter has a base");
                chain.push(current.clone());
            }
            chain.reverse();
            chain
        };
        let plural_of = |unit: &Unit| match unit {
            Unit::Aggregate { plural_space, .. } => plural_space.clone(),
            _ => unreachable!("aggregate batches hold aggregate units"),
        };
        let mut candidates = filtered_chain(&plural_of(&units[0]));
        for unit in &units[1..] {
            let alternates = filtered_chain(&plural_of(unit));
            if alternates.len() < candidates.len() {
                candidates.truncate(alternates.len());
            }
            for idx in 0..candidates.len() {
                if candidates[idx] != alternates[idx] {
                    debug_assert!(idx > 0);
                    candidates.truncate(idx);
                    break;
                }
            }
        }
        let mut shared_space = candidates.last().unwrap().clone();
        // Over a complement, shared filters bring no benefit and would
        // block embedding into the quotient frame.
        if matches!(plural_space.kind, SpaceKind::Complement { .. }) {
            shared_space = plural_space.clone();
        }

        // Move non-shared filters into the operands:
        //   unit(plural?filter{op}) => unit(plural{if(filter, op)})
        let mut codes: Vec<Rc<Code>> = Vec::new();
        let mut filters: Vec<Rc<Code>> = Vec::new();
        for unit in units {
            let code = unit.code().expect("an aggregate unit has a code").clone();
            let mut code_filters = Vec::new();
            let mut unit_space = plural_of(unit);
            while unit_space != shared_space {
                if let SpaceKind::Filtered { filter } = &unit_space.kind {
                    code_filters.push(filter.clone());
                }
                unit_space = unit_space.base.clone().expect("a filter has a base");
            }
            let code = if !code_filters.is_empty() {
                let code_filter = Code::conjoin(code_filters);
                filters.push(code_filter.clone());
                // The operand is an aggregate formula over one argument;
                // the aggregate ignores NULL rows, so a NULL alternative
                // drops the filtered-out rows.
                let Code::Formula {
                    signature,
                    domain,
                    arguments,
                } = &*code
                else {
                    return Err(Error::simple(
                        "cannot recombine an aggregate without an operand",
                    )
                    .into());
                };
                let op = arguments[0].clone();
                let op = Code::formula(
                    Signature::If {
                        branches: 1,
                        has_alternative: false,
                    },
                    op.domain().clone(),
                    vec![code_filter, op],
                );
                let mut arguments = arguments.clone();
                arguments[0] = op;
                Code::formula(signature.clone(), domain.clone(), arguments)
            } else {
                code
            };
            codes.push(code);
        }

        // When every aggregate filters on top of the shared space, the
        // disjunction of the filters can be pushed onto it.
        if !matches!(shared_space.kind, SpaceKind::Complement { .. })
            && units
                .iter()
                .all(|unit| plural_of(unit) != shared_space)
        {
            let filter = Code::disjoin(filters);
            shared_space = Space::filtered(shared_space, filter);
        }

        let mut substate = self.spawn();
        substate.collect_space(base_space);
        substate.collect_space(&shared_space);
        for code in &codes {
            substate.collect_code(code);
        }
        substate.recombine()?;
        let base_space = substate.replace_space(base_space)?;
        let shared_space = substate.replace_space(&shared_space)?;
        let codes = codes
            .iter()
            .map(|code| substate.replace_code(code))
            .collect::<Result<Vec<_>>>()?;

        for (idx, unit) in units.iter().enumerate() {
            let code = codes[idx].clone();
            let companions = codes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, code)| code.clone())
                .collect_vec();
            let replacement = Unit::Aggregate {
                code,
                plural_space: shared_space.clone(),
                space: base_space.clone(),
                companions,
            };
            self.memorize_unit(unit, replacement);
        }

        if is_quotient {
            let hinted = base_space.with_companions(codes);
            self.memorize_space(space, hinted);
        }
        Ok(())
    }

    // -- replace ---------------------------------------------------------

    pub fn replace_segment(&mut self, segment: &SegmentExpr) -> Result<Rc<SegmentExpr>> {
        // The content of each segment recombines against a blank state.
        let mut substate = self.spawn();
        substate.collect_space(&segment.root);
        substate.collect_space(&segment.space);
        for code in &segment.codes {
            substate.collect_code(code);
        }
        substate.recombine()?;
        let root = substate.replace_space(&segment.root)?;
        let space = substate.replace_space(&segment.space)?;
        let codes = segment
            .codes
            .iter()
            .map(|code| substate.replace_code(code))
            .collect::<Result<Vec<_>>>()?;
        let dependents = segment
            .dependents
            .iter()
            .map(|dependent| substate.replace_segment(dependent))
            .collect::<Result<Vec<_>>>()?;
        Ok(Rc::new(SegmentExpr {
            root,
            space,
            codes,
            dependents,
            flow: segment.flow.clone(),
        }))
    }

    pub fn replace_space(&mut self, space: &Rc<Space>) -> Result<Rc<Space>> {
        if let Some(cached) = self.replace_space_cache.get(space) {
            return Ok(cached.clone());
        }
        let replacement = self.replace_space_uncached(space)?;
        self.replace_space_cache
            .insert(space.clone(), replacement.clone());
        Ok(replacement)
    }

    fn replace_space_uncached(&mut self, space: &Rc<Space>) -> Result<Rc<Space>> {
        let Some(base) = &space.base else {
            return Ok(space.clone());
        };
        let base = self.replace_space(base)?;
        match &space.kind {
            SpaceKind::Quotient {
                seed,
                kernels,
                companions,
                ..
            } => {
                let mut substate = self.spawn();
                substate.collect_space(seed);
                for code in kernels {
                    substate.collect_code(code);
                }
                substate.recombine()?;
                let seed = substate.replace_space(seed)?;
                let kernels = kernels
                    .iter()
                    .map(|code| substate.replace_code(code))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Space::quotient_with(base, seed, kernels, companions.clone()))
            }
            SpaceKind::Moniker {
                seed, companions, ..
            } => {
                let mut substate = self.spawn();
                substate.collect_space(seed);
                substate.recombine()?;
                let seed = substate.replace_space(seed)?;
                Ok(Space::moniker(base, seed, companions.clone()))
            }
            SpaceKind::Clipped {
                seed,
                limit,
                offset,
                companions,
                ..
            } => {
                let mut substate = self.spawn();
                substate.collect_space(seed);
                substate.recombine()?;
                let seed = substate.replace_space(seed)?;
                Ok(Space::clipped(base, seed, *limit, *offset, companions.clone()))
            }
            SpaceKind::Forked {
                seed,
                kernels,
                companions,
                ..
            } => {
                let kernels = kernels
                    .iter()
                    .map(|code| self.replace_code(code))
                    .collect::<Result<Vec<_>>>()?;
                let mut substate = self.spawn();
                substate.collect_space(seed);
                substate.recombine()?;
                let seed = substate.replace_space(seed)?;
                Ok(Space::forked(base, seed, kernels, companions.clone()))
            }
            SpaceKind::Attach {
                seed,
                images,
                filter,
                companions,
                ..
            } => {
                let images = self.replace_images(seed, images)?;
                Ok(Space::attach(
                    base,
                    self.replace_attach_seed(seed)?,
                    images,
                    filter.clone(),
                    companions.clone(),
                ))
            }
            SpaceKind::Locator {
                seed,
                images,
                filter,
                companions,
                ..
            } => {
                let images = self.replace_images(seed, images)?;
                Ok(Space::locator(
                    base,
                    self.replace_attach_seed(seed)?,
                    images,
                    filter.clone(),
                    companions.clone(),
                ))
            }
            SpaceKind::Filtered { filter } => {
                let filter = self.replace_code(filter)?;
                Ok(Space::filtered(base, filter))
            }
            SpaceKind::Ordered {
                order,
                limit,
                offset,
            } => {
                let order = order
                    .iter()
                    .map(|(code, direction)| Ok((self.replace_code(code)?, *direction)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Space::ordered(base, order, *limit, *offset))
            }
            _ => Ok(space.clone_with_base(Some(base))),
        }
    }

    fn replace_attach_seed(&mut self, seed: &Rc<Space>) -> Result<Rc<Space>> {
        let mut substate = self.spawn();
        substate.collect_space(seed);
        substate.recombine()?;
        substate.replace_space(seed)
    }

    fn replace_images(
        &mut self,
        seed: &Rc<Space>,
        images: &[(Rc<Code>, Rc<Code>)],
    ) -> Result<Vec<(Rc<Code>, Rc<Code>)>> {
        // Base-side images replace in the main state, seed-side ones in a
        // blank state shared with the seed.
        let images = images
            .iter()
            .map(|(lop, rop)| Ok((self.replace_code(lop)?, rop.clone())))
            .collect::<Result<Vec<_>>>()?;
        let mut substate = self.spawn();
        substate.collect_space(seed);
        for (_, rop) in &images {
            substate.collect_code(rop);
        }
        substate.recombine()?;
        images
            .into_iter()
            .map(|(lop, rop)| Ok((lop, substate.replace_code(&rop)?)))
            .collect()
    }

    pub fn replace_code(&mut self, code: &Rc<Code>) -> Result<Rc<Code>> {
        if let Some(cached) = self.replace_code_cache.get(code) {
            return Ok(cached.clone());
        }
        let replacement = self.replace_code_uncached(code)?;
        self.replace_code_cache
            .insert(code.clone(), replacement.clone());
        Ok(replacement)
    }

    fn replace_code_uncached(&mut self, code: &Rc<Code>) -> Result<Rc<Code>> {
        match &**code {
            Code::Literal { .. } | Code::Correlation { .. } => Ok(code.clone()),
            Code::Cast { base, domain } => {
                let base = self.replace_code(base)?;
                Ok(Rc::new(Code::Cast {
                    base,
                    domain: domain.clone(),
                }))
            }
            Code::Formula {
                signature,
                domain,
                arguments,
            } => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.replace_code(argument))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Code::formula(signature.clone(), domain.clone(), arguments))
            }
            Code::Unit(unit) => Ok(self.replace_unit(unit)?),
        }
    }

    fn replace_unit(&mut self, unit: &Unit) -> Result<Rc<Code>> {
        Ok(match unit {
            Unit::Column {
                column,
                space,
                domain,
            } => {
                let mut substate = self.spawn();
                substate.collect_space(space);
                substate.recombine()?;
                let space = substate.replace_space(space)?;
                Unit::Column {
                    column: *column,
                    space,
                    domain: domain.clone(),
                }
                .into_code()
            }
            Unit::Scalar {
                code,
                space,
                companions,
            } => {
                let mut substate = self.spawn();
                substate.collect_code(code);
                substate.collect_space(space);
                substate.recombine()?;
                let code = substate.replace_code(code)?;
                let space = substate.replace_space(space)?;
                Unit::Scalar {
                    code,
                    space,
                    companions: companions.clone(),
                }
                .into_code()
            }
            Unit::Aggregate {
                code,
                plural_space,
                space,
                companions,
            } => {
                let mut substate = self.spawn();
                substate.collect_code(code);
                substate.collect_space(plural_space);
                substate.collect_space(space);
                substate.recombine()?;
                let code = substate.replace_code(code)?;
                let plural_space = substate.replace_space(plural_space)?;
                let space = substate.replace_space(space)?;
                Unit::Aggregate {
                    code,
                    plural_space,
                    space,
                    companions: companions.clone(),
                }
                .into_code()
            }
            Unit::Correlated {
                code,
                plural_space,
                space,
            } => {
                let mut substate = self.spawn();
                substate.collect_code(code);
                substate.collect_space(plural_space);
                substate.collect_space(space);
                substate.recombine()?;
                let code = substate.replace_code(code)?;
                let plural_space = substate.replace_space(plural_space)?;
                let space = substate.replace_space(space)?;
                Unit::Correlated {
                    code,
                    plural_space,
                    space,
                }
                .into_code()
            }
            Unit::Kernel { code, space } => {
                let index = space
                    .quotient_kernels()
                    .iter()
                    .position(|kernel| kernel == code)
                    .expect("a kernel unit refers to its quotient kernel");
                let mut substate = self.spawn();
                substate.collect_space(space);
                substate.recombine()?;
                let space = substate.replace_space(space)?;
                let code = space.quotient_kernels()[index].clone();
                Unit::Kernel { code, space }.into_code()
            }
            Unit::Covering { code, space } => {
                let mut substate = self.spawn();
                substate.collect_code(code);
                substate.collect_space(space);
                substate.recombine()?;
                let code = substate.replace_code(code)?;
                let space = substate.replace_space(space)?;
                Unit::Covering { code, space }.into_code()
            }
        })
    }
}

/// Signature-specific simplification of a formula whose arguments are
/// already rewritten.
fn rewrite_by_signature(
    signature: &Signature,
    domain: &Domain,
    mut arguments: Vec<Rc<Code>>,
) -> Rc<Code> {
    match signature {
        Signature::Contains { polarity } => {
            let rop = arguments.pop().unwrap();
            let lop = arguments.pop().unwrap();
            let rop = like_pattern(rop, true, true);
            Code::formula(
                Signature::Like {
                    polarity: *polarity,
                },
                domain.clone(),
                vec![lop, rop],
            )
        }
        Signature::HasPrefix => {
            let rop = arguments.pop().unwrap();
            let lop = arguments.pop().unwrap();
            let rop = like_pattern(rop, false, true);
            Code::formula(
                Signature::Like {
                    polarity: Polarity::Positive,
                },
                domain.clone(),
                vec![lop, rop],
            )
        }
        Signature::Length => {
            // `length` of NULL counts as 0.
            let op = arguments.pop().unwrap();
            let length = Code::formula(Signature::CharLength, Domain::Integer, vec![op]);
            Code::formula(
                Signature::IfNull,
                Domain::Integer,
                vec![length, Code::integer_literal(0)],
            )
        }
        Signature::Head { has_length } => rewrite_head(domain, arguments, *has_length),
        Signature::Tail { has_length } => rewrite_tail(domain, arguments, *has_length),
        Signature::Slice => rewrite_slice(domain, arguments),
        Signature::At { has_length } => rewrite_at(domain, arguments, *has_length),
        _ => Code::formula(signature.clone(), domain.clone(), arguments),
    }
}

/// Builds a `LIKE` pattern from a search string, escaping `\`, `%` and
/// `_`; literal patterns fold at compile time.
fn like_pattern(rop: Rc<Code>, prefix_wild: bool, suffix_wild: bool) -> Rc<Code> {
    if let Code::Literal { value, domain } = &*rop {
        let value = match value {
            Value::Null => Value::Null,
            Value::Text(text) => {
                let escaped = text
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                let mut pattern = String::new();
                if prefix_wild {
                    pattern.push('%');
                }
                pattern.push_str(&escaped);
                if suffix_wild {
                    pattern.push('%');
                }
                Value::Text(pattern)
            }
            other => other.clone(),
        };
        return Code::literal(value, domain.clone());
    }
    let domain = rop.domain().clone();
    let percent = Code::literal(Value::Text("%".into()), domain.clone());
    let mut pattern = rop;
    for (old, new) in [("\\", "\\\\"), ("%", "\\%"), ("_", "\\_")] {
        pattern = Code::formula(
            Signature::Replace,
            domain.clone(),
            vec![
                pattern,
                Code::literal(Value::Text(old.into()), domain.clone()),
                Code::literal(Value::Text(new.into()), domain.clone()),
            ],
        );
    }
    if prefix_wild {
        pattern = Code::formula(
            Signature::Concatenate,
            domain.clone(),
            vec![percent.clone(), pattern],
        );
    }
    if suffix_wild {
        pattern = Code::formula(Signature::Concatenate, domain.clone(), vec![pattern, percent]);
    }
    pattern
}

fn compare(relation: crate::tr::signature::Relation, lop: Rc<Code>, rop: Rc<Code>) -> Rc<Code> {
    Code::formula(
        Signature::Compare { relation },
        Domain::Boolean,
        vec![lop, rop],
    )
}

fn char_length(op: Rc<Code>) -> Rc<Code> {
    Code::formula(Signature::CharLength, Domain::Integer, vec![op])
}

/// `head(op, n)`: the first `n` characters; a negative `n` counts from
/// the end; `n` defaults to 1.
fn rewrite_head(domain: &Domain, mut arguments: Vec<Rc<Code>>, has_length: bool) -> Rc<Code> {
    let length = if has_length {
        arguments.pop().unwrap()
    } else {
        Code::integer_literal(1)
    };
    let op = arguments.pop().unwrap();
    let one = Code::integer_literal(1);
    let zero = Code::integer_literal(0);
    let mut length = length;
    if let Code::Literal { value, .. } = &*length {
        match value {
            Value::Null => length = one.clone(),
            Value::Integer(n) if *n >= 0 => {
                return Code::formula(
                    Signature::Substring { has_length: true },
                    domain.clone(),
                    vec![op, one, length],
                );
            }
            _ => {}
        }
    }
    let length = Code::formula(
        Signature::IfNull,
        Domain::Integer,
        vec![length, one.clone()],
    );
    let negative_length = Code::formula(
        Signature::Add,
        Domain::Integer,
        vec![char_length(op.clone()), length.clone()],
    );
    let if_positive = compare(
        crate::tr::signature::Relation::Ge,
        length.clone(),
        zero.clone(),
    );
    let if_negative = compare(
        crate::tr::signature::Relation::Ge,
        negative_length.clone(),
        zero.clone(),
    );
    let length = Code::formula(
        Signature::If {
            branches: 2,
            has_alternative: true,
        },
        Domain::Integer,
        vec![if_positive, if_negative, length, negative_length, zero],
    );
    Code::formula(
        Signature::Substring { has_length: true },
        domain.clone(),
        vec![op, one, length],
    )
}

/// `tail(op, n)`: the last `n` characters; a negative `n` counts from
/// the start; `n` defaults to 1.
fn rewrite_tail(domain: &Domain, mut arguments: Vec<Rc<Code>>, has_length: bool) -> Rc<Code> {
    let length = if has_length {
        arguments.pop().unwrap()
    } else {
        Code::integer_literal(1)
    };
    let op = arguments.pop().unwrap();
    let one = Code::integer_literal(1);
    let zero = Code::integer_literal(0);
    let mut length = length;
    if let Code::Literal { value, .. } = &*length {
        match value {
            Value::Null => length = one.clone(),
            Value::Integer(n) if *n < 0 => {
                let start = Code::integer_literal(1 - *n);
                return Code::formula(
                    Signature::Substring { has_length: false },
                    domain.clone(),
                    vec![op, start],
                );
            }
            _ => {}
        }
    }
    let length = Code::formula(
        Signature::IfNull,
        Domain::Integer,
        vec![length, one.clone()],
    );
    let start = Code::formula(
        Signature::Subtract,
        Domain::Integer,
        vec![one.clone(), length.clone()],
    );
    let positive_start = Code::formula(
        Signature::Add,
        Domain::Integer,
        vec![char_length(op.clone()), start.clone()],
    );
    let if_negative = compare(
        crate::tr::signature::Relation::Lt,
        length.clone(),
        zero,
    );
    let if_positive = compare(
        crate::tr::signature::Relation::Le,
        length,
        char_length(op.clone()),
    );
    let start = Code::formula(
        Signature::If {
            branches: 2,
            has_alternative: true,
        },
        Domain::Integer,
        vec![if_negative, if_positive, start, positive_start, one],
    );
    Code::formula(
        Signature::Substring { has_length: false },
        domain.clone(),
        vec![op, start],
    )
}

/// `slice(op, left, right)`: characters between the bounds; negative
/// bounds count from the end; NULL bounds mean the respective edge.
fn rewrite_slice(domain: &Domain, mut arguments: Vec<Rc<Code>>) -> Rc<Code> {
    let right = arguments.pop().unwrap();
    let left = arguments.pop().unwrap();
    let op = arguments.pop().unwrap();
    let zero = Code::integer_literal(0);
    let one = Code::integer_literal(1);
    // Normalize a bound: NULL -> edge, negative -> length + bound,
    // clamped at zero.
    let normalize = |bound: Rc<Code>, edge: Rc<Code>| -> Rc<Code> {
        if let Code::Literal { value, .. } = &*bound {
            match value {
                Value::Null => return edge,
                Value::Integer(n) if *n >= 0 => return bound,
                _ => {}
            }
        }
        let shifted = Code::formula(
            Signature::Add,
            Domain::Integer,
            vec![char_length(op.clone()), bound.clone()],
        );
        let clamped = Code::formula(
            Signature::If {
                branches: 1,
                has_alternative: true,
            },
            Domain::Integer,
            vec![
                compare(
                    crate::tr::signature::Relation::Ge,
                    shifted.clone(),
                    zero.clone(),
                ),
                shifted,
                zero.clone(),
            ],
        );
        let bound = Code::formula(
            Signature::If {
                branches: 1,
                has_alternative: true,
            },
            Domain::Integer,
            vec![
                compare(
                    crate::tr::signature::Relation::Ge,
                    Code::formula(
                        Signature::IfNull,
                        Domain::Integer,
                        vec![bound.clone(), zero.clone()],
                    ),
                    zero.clone(),
                ),
                Code::formula(Signature::IfNull, Domain::Integer, vec![bound, edge.clone()]),
                clamped,
            ],
        );
        bound
    };
    let left = normalize(left, zero.clone());
    let right = normalize(right, char_length(op.clone()));
    let start = Code::formula(Signature::Add, Domain::Integer, vec![left.clone(), one]);
    let length = Code::formula(Signature::Subtract, Domain::Integer, vec![right, left]);
    let length = Code::formula(
        Signature::If {
            branches: 1,
            has_alternative: true,
        },
        Domain::Integer,
        vec![
            compare(
                crate::tr::signature::Relation::Ge,
                length.clone(),
                zero.clone(),
            ),
            length,
            zero,
        ],
    );
    Code::formula(
        Signature::Substring { has_length: true },
        domain.clone(),
        vec![op, start, length],
    )
}

/// `at(op, index, length)`: a slice of `length` characters starting at
/// `index`; a negative index counts from the end.
fn rewrite_at(domain: &Domain, mut arguments: Vec<Rc<Code>>, has_length: bool) -> Rc<Code> {
    let length = if has_length {
        arguments.pop().unwrap()
    } else {
        Code::integer_literal(1)
    };
    let index = arguments.pop().unwrap();
    let op = arguments.pop().unwrap();
    // at(op, i, n) == slice(op, i, i + n) with a negative n folding to
    // an empty slice.
    let right = Code::formula(
        Signature::Add,
        Domain::Integer,
        vec![index.clone(), length],
    );
    rewrite_slice(domain, vec![op, index, right])
}

/// Applies the rewriting process to a segment expression:
/// rewrite, unmask, collect, recombine, then replace.
pub fn rewrite(segment: &Rc<SegmentExpr>, catalog: &Catalog) -> Result<Rc<SegmentExpr>> {
    log::debug!("rewriting the space and code graph");
    let mut state = RewritingState::new(catalog);
    let segment = state.rewrite_segment(segment)?;
    let segment = state.unmask_segment(&segment, None)?;
    // Unit collection happens per segment inside replace; the top-level
    // collection stays empty.
    state.recombine()?;
    state.replace_segment(&segment)
}
