//! Space+Code → Term.
//!
//! `compile_space` builds a term exporting the given space together with
//! all its ancestors down to the current baseline; `inject` augments a
//! term with whatever it lacks to export an expression.  Shoot terms are
//! grown for plural and detached spaces and glued back to the trunk with
//! joints produced by the stitch adapters.

use std::collections::HashMap;
use std::rc::Rc;

use crate::catalog::Catalog;
use crate::domain::Domain;
use crate::error::{guard, Error, Result};
use crate::syntax::Direction;
use crate::tr::signature::{Polarity, Signature};
use crate::tr::space::{Code, SegmentExpr, Space, SpaceKind, Unit};
use crate::tr::stitch::{arrange, sew, spread, tie};
use crate::tr::term::{Joint, Tag, Term, TermKind};

pub struct CompilingState<'a> {
    pub catalog: &'a Catalog,
    next_tag: usize,
    root: Rc<Space>,
    baseline: Rc<Space>,
    baseline_stack: Vec<Rc<Space>>,
    superspace: Rc<Space>,
    superspace_stack: Vec<Rc<Space>>,
}

impl<'a> CompilingState<'a> {
    pub fn new(catalog: &'a Catalog) -> CompilingState<'a> {
        let root = Space::root();
        CompilingState {
            catalog,
            next_tag: 1,
            baseline: root.clone(),
            superspace: root.clone(),
            root,
            baseline_stack: Vec::new(),
            superspace_stack: Vec::new(),
        }
    }

    fn tag(&mut self) -> Tag {
        let tag = Tag(self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn push_baseline(&mut self, baseline: Rc<Space>) {
        debug_assert!(baseline.is_inflated);
        self.baseline_stack
            .push(std::mem::replace(&mut self.baseline, baseline));
    }

    fn pop_baseline(&mut self) {
        self.baseline = self.baseline_stack.pop().expect("unbalanced baseline stack");
    }

    fn push_superspace(&mut self, superspace: Rc<Space>) {
        self.superspace_stack
            .push(std::mem::replace(&mut self.superspace, superspace));
    }

    fn pop_superspace(&mut self) {
        self.superspace = self
            .superspace_stack
            .pop()
            .expect("unbalanced superspace stack");
    }

    /// Compiles a term for the space; the term must export the space and
    /// all inflated prefixes down to the baseline.
    pub fn compile_space(
        &mut self,
        space: &Rc<Space>,
        baseline: Option<Rc<Space>>,
    ) -> Result<Term> {
        let pushed = baseline.is_some();
        if let Some(baseline) = baseline {
            self.push_baseline(baseline);
        }
        let term = self.compile_space_dispatch(space);
        if pushed {
            self.pop_baseline();
        }
        term
    }

    fn compile_space_dispatch(&mut self, space: &Rc<Space>) -> Result<Term> {
        debug_assert!(space.concludes(&self.baseline));
        match &space.kind {
            SpaceKind::Root | SpaceKind::Scalar => self.compile_scalar(space),
            SpaceKind::DirectTable { .. } | SpaceKind::FiberTable { .. } => {
                self.compile_table(space)
            }
            SpaceKind::Quotient { .. } => self.compile_quotient(space),
            SpaceKind::Complement { .. } => self.compile_complement(space),
            SpaceKind::Moniker { .. }
            | SpaceKind::Forked { .. }
            | SpaceKind::Attach { .. }
            | SpaceKind::Locator { .. }
            | SpaceKind::Clipped { .. } => self.compile_covering(space),
            SpaceKind::Filtered { .. } => self.compile_filtered(space),
            SpaceKind::Ordered { .. } => self.compile_ordered(space),
        }
    }

    /// Augments the term to make it export the given expressions.
    pub fn inject(&mut self, mut term: Term, codes: &[Rc<Code>]) -> Result<Term> {
        // Scalar units with companions go first.
        let mut codes = codes.to_vec();
        codes.sort_by_key(|code| std::cmp::Reverse(code.priority()));
        for code in codes {
            if let Code::Unit(unit) = &*code {
                if term.routes.contains_key(unit) {
                    continue;
                }
                term = self.inject_unit(term, unit)?;
            } else {
                for unit in code.units() {
                    if term.routes.contains_key(&unit) {
                        continue;
                    }
                    term = self.inject_unit(term, &unit)?;
                }
            }
        }
        Ok(term)
    }

    // -- shoots and joints ----------------------------------------------

    /// Compiles a term for a space that will eventually be joined to a
    /// term representing the trunk space.
    fn compile_shoot(
        &mut self,
        space: &Rc<Space>,
        trunk: &Rc<Space>,
        codes: Option<&[Rc<Code>]>,
    ) -> Result<Term> {
        // Unmasking has pruned all non-axial operations of the trunk
        // from the shoot space.
        debug_assert_eq!(space, &space.prune(trunk));

        let mut baseline = space.clone();
        while !baseline.is_inflated {
            baseline = baseline.base.clone().expect("an uninflated space has a base");
        }
        // A plural shoot will be projected onto a singular prefix before
        // joining; the base of its baseline must be spanned by the trunk
        // so the projection has columns to run on.
        if !trunk.spans(&baseline) {
            while !matches!(&baseline.base, Some(base) if trunk.spans(base)) {
                baseline = baseline.base.clone().expect("a shoot baseline above the root");
            }
        }
        let mut term = self.compile_space(space, Some(baseline))?;
        if let Some(codes) = codes {
            term = self.inject(term, codes)?;
        }
        Ok(term)
    }

    /// Joints attaching a shoot term to a trunk term without changing the
    /// cardinality of the latter.
    fn glue_spaces(
        &mut self,
        space: &Rc<Space>,
        baseline: &Rc<Space>,
        shoot: &Rc<Space>,
        shoot_baseline: &Rc<Space>,
    ) -> Result<Vec<Joint>> {
        debug_assert!(baseline.is_inflated);
        debug_assert!(shoot_baseline.is_inflated);
        debug_assert!(shoot.concludes(shoot_baseline));

        let backbone = space.inflate();
        let shoot_backbone = shoot.inflate();
        let mut joints = Vec::new();
        if backbone.concludes(shoot_baseline) {
            // The shoot baseline is an axis of the trunk: join on all
            // common axes exported by the shoot.
            let mut axis = backbone;
            while !shoot_backbone.concludes(&axis) {
                axis = axis.base.clone().expect("a common axis exists");
            }
            let stop = shoot_baseline.base.clone();
            let mut axes = Vec::new();
            let mut cursor = Some(axis);
            while cursor != stop {
                let axis = cursor.expect("the walk ends at the shoot baseline base");
                if !axis.is_contracting || &axis == shoot_baseline {
                    axes.push(axis.clone());
                }
                cursor = axis.base.clone();
            }
            axes.reverse();
            for axis in axes {
                joints.extend(sew(self.catalog, &axis)?);
            }
        } else {
            // The shoot does not touch the trunk: attach it serially
            // between the shoot baseline and its base.
            joints = tie(self.catalog, shoot_baseline)?;

            // When the origin is an unexported ancestor of the trunk
            // baseline, merge the two serial ties instead of growing the
            // trunk downward.
            if let Some(origin) = &shoot_baseline.base {
                if baseline.concludes(origin) && baseline != origin {
                    let mut axis = baseline.clone();
                    while axis.base.as_ref() != Some(origin) {
                        axis = axis.base.clone().expect("the walk ends at the origin");
                    }
                    let shoot_joints = joints.clone();
                    let trunk_joints = tie(self.catalog, &axis)?;
                    if trunk_joints.len() == shoot_joints.len()
                        && trunk_joints
                            .iter()
                            .zip(shoot_joints.iter())
                            .all(|(trunk_joint, shoot_joint)| trunk_joint.lop == shoot_joint.lop)
                    {
                        joints = trunk_joints
                            .iter()
                            .zip(shoot_joints.iter())
                            .map(|(trunk_joint, shoot_joint)| {
                                Joint::new(trunk_joint.rop.clone(), shoot_joint.rop.clone())
                            })
                            .collect();
                    }
                }
            }
        }
        Ok(joints)
    }

    fn glue_terms(&mut self, trunk_term: &Term, shoot_term: &Term) -> Result<Vec<Joint>> {
        self.glue_spaces(
            &trunk_term.space,
            &trunk_term.baseline,
            &shoot_term.space,
            &shoot_term.baseline,
        )
    }

    /// Makes sure the trunk term can export the left side of the joints.
    fn inject_joints(&mut self, term: Term, joints: &[Joint]) -> Result<Term> {
        let codes: Vec<Rc<Code>> = joints.iter().map(|joint| joint.lop.clone()).collect();
        self.inject(term, &codes)
    }

    /// Attaches a singular shoot term to a trunk term.
    fn join_terms(
        &mut self,
        trunk_term: Term,
        shoot_term: Term,
        extra_routes: HashMap<Unit, Tag>,
    ) -> Result<Term> {
        debug_assert!(trunk_term.space.spans(&shoot_term.space));
        let joints = self.glue_terms(&trunk_term, &shoot_term)?;
        let trunk_term = self.inject_joints(trunk_term, &joints)?;
        // An inner join is possible when it cannot decrease the trunk
        // cardinality: the shoot must dominate the closest spanned
        // ancestor of the trunk.
        let mut space = trunk_term.space.clone();
        while !shoot_term.space.spans(&space) {
            space = space.base.clone().expect("the root is always spanned");
        }
        let is_left = !shoot_term.space.dominates(&space);
        let mut routes = trunk_term.routes.clone();
        routes.extend(extra_routes);
        let space = trunk_term.space.clone();
        let baseline = trunk_term.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Join {
                lkid: Box::new(trunk_term),
                rkid: Box::new(shoot_term),
                joints,
                is_left,
                is_right: false,
            },
            space,
            baseline,
            routes,
        ))
    }

    // -- space compilers -------------------------------------------------

    fn compile_scalar(&mut self, space: &Rc<Space>) -> Result<Term> {
        if space == &self.baseline {
            return Ok(Term::new(
                self.tag(),
                TermKind::Scalar,
                space.clone(),
                space.clone(),
                HashMap::new(),
            ));
        }
        let base = space.base.clone().expect("a scalar space has a base");
        let term = self.compile_space(&base, None)?;
        let baseline = term.baseline.clone();
        let routes = term.routes.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Wrapper {
                kid: Box::new(term),
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    fn compile_table(&mut self, space: &Rc<Space>) -> Result<Term> {
        let table = space.family.table().expect("a table space");
        // At the baseline, a plain table term.
        if space == &self.baseline {
            let tag = self.tag();
            let mut routes = HashMap::new();
            for unit in spread(self.catalog, space)? {
                routes.insert(unit, tag);
            }
            return Ok(Term::new(
                tag,
                TermKind::Table(table),
                space.clone(),
                self.baseline.clone(),
                routes,
            ));
        }

        let backbone = space.inflate();
        let base = space.base.clone().expect("a non-baseline space has a base");
        let term = self.compile_space(&base, None)?;

        // The parent term can serve as the term of the space itself when
        // it already exports the backbone and the cardinality matches.
        if space.conforms(&term.space)
            && spread(self.catalog, &backbone)?
                .iter()
                .all(|unit| term.routes.contains_key(unit))
        {
            let mut routes = term.routes.clone();
            for unit in spread(self.catalog, space)? {
                let target = *routes
                    .get(&unit.with_space(backbone.clone()))
                    .expect("the backbone is exported");
                routes.insert(unit, target);
            }
            let baseline = term.baseline.clone();
            return Ok(Term::new(
                self.tag(),
                TermKind::Wrapper {
                    kid: Box::new(term),
                },
                space.clone(),
                baseline,
                routes,
            ));
        }

        // The general case: join the parent term with a fresh table term
        // over the serial tie.
        let lkid = term;
        let rkid = self.compile_space(&backbone, Some(backbone.clone()))?;
        let joints = tie(self.catalog, space)?;
        let mut routes = HashMap::new();
        routes.extend(lkid.routes.clone());
        routes.extend(rkid.routes.clone());
        for unit in spread(self.catalog, space)? {
            let target = *routes
                .get(&unit.with_space(backbone.clone()))
                .expect("the table term exports the backbone");
            routes.insert(unit, target);
        }
        let baseline = lkid.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Join {
                lkid: Box::new(lkid),
                rkid: Box::new(rkid),
                joints,
                is_left: false,
                is_right: false,
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    fn compile_quotient(&mut self, space: &Rc<Space>) -> Result<Term> {
        let SpaceKind::Quotient {
            seed,
            ground,
            kernels,
            companions,
        } = &space.kind
        else {
            unreachable!();
        };
        let backbone = space.inflate();

        // The seed term, with its baseline at the (inflated) ground.
        let mut baseline = ground.clone();
        while !baseline.is_inflated {
            baseline = baseline.base.clone().expect("an uninflated ground has a base");
        }
        let mut seed_term = self.compile_space(seed, Some(baseline))?;

        // Inject the kernel and filter out NULL kernel values.
        if !kernels.is_empty() {
            seed_term = self.inject(seed_term, kernels)?;
            let filter = Code::conjoin(
                kernels
                    .iter()
                    .map(|code| Code::is_not_null(code.clone()))
                    .collect(),
            );
            seed_term = self.wrap_filter(seed_term, filter);
        }
        seed_term = self.wrap(seed_term);

        let is_regular = &seed_term.baseline == ground;

        // Aggregates suggested by the rewriter are injected by disguising
        // the seed term as the complement of the quotient.
        let mut aggregates: Vec<Rc<Code>> = Vec::new();
        let quotient = backbone.with_companions(Vec::new());
        let complement = Space::complement(quotient);
        if !companions.is_empty() && is_regular {
            let mut routes: HashMap<Unit, Tag> = HashMap::new();
            for unit in seed_term.routes.keys() {
                let covering = Unit::Covering {
                    code: unit.clone().into_code(),
                    space: complement.clone(),
                };
                routes.insert(covering, seed_term.tag);
            }
            for code in kernels {
                let covering = Unit::Covering {
                    code: code.clone(),
                    space: complement.clone(),
                };
                routes.insert(covering, seed_term.tag);
            }
            let inflated_seed = seed.inflate();
            for unit in spread(self.catalog, &inflated_seed)? {
                if let Some(target) = seed_term.routes.get(&unit) {
                    routes.insert(unit.with_space(complement.clone()), *target);
                }
            }
            let complement_term = Term::new(
                self.tag(),
                TermKind::Wrapper {
                    kid: Box::new(seed_term.clone()),
                },
                complement.clone(),
                complement.clone(),
                routes,
            );
            let complement_term = self.inject(complement_term, companions)?;
            // The injection must not have disturbed the shape.
            if complement_term.baseline == complement {
                aggregates = companions.clone();
                let mut routes: HashMap<Unit, Tag> = HashMap::new();
                for code in &aggregates {
                    for unit in code.units() {
                        if let Some(target) = complement_term.routes.get(&unit) {
                            routes.insert(unit, *target);
                        }
                    }
                }
                routes.extend(seed_term.routes.clone());
                let space = seed_term.space.clone();
                let baseline = seed_term.baseline.clone();
                seed_term = Term::new(
                    self.tag(),
                    TermKind::Wrapper {
                        kid: Box::new(complement_term),
                    },
                    space,
                    baseline,
                    routes,
                );
            }
        }

        // The trunk term and the joints attaching the projection to it.
        let mut trunk_term: Option<Term> = None;
        let mut basis: Vec<Rc<Code>> = Vec::new();
        let mut units: Vec<Unit> = Vec::new();
        let mut joints: Vec<Joint> = Vec::new();

        if is_regular {
            if space != &self.baseline {
                let base = space.base.clone().expect("a quotient has a base");
                trunk_term = Some(self.compile_space(&base, None)?);
                joints = tie(self.catalog, space)?;
            }
        } else {
            // The seed baseline fell below the ground: the irregular ties
            // must be hidden behind a manual projection join.
            let mut baseline = self.baseline.clone();
            if &baseline == space {
                baseline = baseline.base.clone().expect("a quotient has a base");
            }
            let base = space.base.clone().expect("a quotient has a base");
            let trunk = self.compile_space(&base, Some(baseline))?;
            let seed_joints = self.glue_terms(&trunk, &seed_term)?;
            for joint in seed_joints {
                basis.push(joint.rop.clone());
                let unit = Unit::Kernel {
                    code: joint.rop.clone(),
                    space: backbone.clone(),
                };
                units.push(unit.clone());
                joints.push(joint.with_rop(unit.into_code()));
            }
            trunk_term = Some(trunk);
        }

        // The projection basis: the ground tie plus the kernel.
        for joint in tie(self.catalog, ground)? {
            basis.push(joint.rop.clone());
            units.push(Unit::Kernel {
                code: joint.rop,
                space: backbone.clone(),
            });
        }
        for code in kernels {
            basis.push(code.clone());
            units.push(Unit::Kernel {
                code: code.clone(),
                space: backbone.clone(),
            });
        }
        for code in &aggregates {
            units.push(Unit::Aggregate {
                code: code.clone(),
                plural_space: complement.clone(),
                space: backbone.clone(),
                companions: Vec::new(),
            });
        }

        let tag = self.tag();
        let mut routes = HashMap::new();
        for unit in &units {
            routes.insert(unit.clone(), tag);
        }
        let term = Term::new(
            tag,
            TermKind::Projection {
                kid: Box::new(seed_term),
                kernels: basis,
            },
            backbone.clone(),
            backbone.clone(),
            routes,
        );

        let Some(trunk_term) = trunk_term else {
            return Ok(term);
        };

        let lkid = self.inject_joints(trunk_term, &joints)?;
        let rkid = term;
        let mut routes = HashMap::new();
        routes.extend(lkid.routes.clone());
        routes.extend(rkid.routes.clone());
        for unit in &units {
            routes.insert(unit.with_space(space.clone()), rkid.tag);
        }
        let baseline = lkid.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Join {
                lkid: Box::new(lkid),
                rkid: Box::new(rkid),
                joints,
                is_left: false,
                is_right: false,
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    fn compile_complement(&mut self, space: &Rc<Space>) -> Result<Term> {
        let SpaceKind::Complement {
            seed,
            ground,
            kernels,
            companions,
        } = &space.kind
        else {
            unreachable!();
        };
        let backbone = space.inflate();
        let quotient_space = space.base.clone().expect("a complement has a base");

        // The seed term; NULL kernels are filtered by the quotient, so no
        // filter is needed here unless the term doubles as the quotient.
        let mut baseline = ground.clone();
        while !baseline.is_inflated {
            baseline = baseline.base.clone().expect("an uninflated ground has a base");
        }
        let mut seed_term = self.compile_space(seed, Some(baseline))?;
        let mut to_inject = kernels.clone();
        to_inject.extend(companions.iter().cloned());
        seed_term = self.inject(seed_term, &to_inject)?;

        let is_regular = &seed_term.baseline == ground;

        // Whether the term also exports the parent quotient space.
        let has_quotient = (self.baseline != *space || !is_regular)
            && matches!(quotient_space.kind, SpaceKind::Quotient { .. })
            && quotient_space.companions().is_empty();

        if has_quotient && !kernels.is_empty() {
            let filter = Code::conjoin(
                kernels
                    .iter()
                    .map(|code| Code::is_not_null(code.clone()))
                    .collect(),
            );
            seed_term = self.wrap_filter(seed_term, filter);
        }
        seed_term = self.wrap(seed_term);

        let mut trunk_term: Option<Term> = None;
        let mut covering_units: Vec<Unit> = Vec::new();
        let mut quotient_units: Vec<Unit> = Vec::new();
        let mut joints: Vec<Joint> = Vec::new();

        // The trunk space: the parent, or the grandparent when the
        // quotient is included.
        let mut axis = quotient_space.clone();
        if has_quotient {
            axis = axis.base.clone().expect("a quotient has a base");
        }
        let mut baseline = self.baseline.clone();
        if !is_regular {
            while !axis.concludes(&baseline) {
                baseline = baseline.base.clone().expect("a baseline above the axis");
            }
        }
        if axis.concludes(&baseline) {
            trunk_term = Some(self.compile_space(&axis, Some(baseline))?);
        }

        if let Some(trunk) = &trunk_term {
            if !is_regular {
                let seed_joints = self.glue_terms(trunk, &seed_term)?;
                for joint in seed_joints {
                    let unit = Unit::Covering {
                        code: joint.rop.clone(),
                        space: backbone.clone(),
                    };
                    joints.push(joint.with_rop(unit.clone().into_code()));
                    covering_units.push(unit);
                }
            }
            if has_quotient {
                joints.extend(tie(self.catalog, &quotient_space)?);
            } else {
                joints.extend(tie(self.catalog, space)?);
            }
        }

        if has_quotient {
            let quotient_backbone = quotient_space.inflate();
            quotient_units = spread(self.catalog, &quotient_backbone)?;
        }

        // Wrap everything produced by the seed term.
        for unit in seed_term.routes.keys() {
            covering_units.push(Unit::Covering {
                code: unit.clone().into_code(),
                space: backbone.clone(),
            });
        }
        for joint in tie(self.catalog, ground)? {
            covering_units.push(Unit::Covering {
                code: joint.rop,
                space: backbone.clone(),
            });
        }
        for code in kernels.iter().chain(companions.iter()) {
            covering_units.push(Unit::Covering {
                code: code.clone(),
                space: backbone.clone(),
            });
        }

        let mut routes: HashMap<Unit, Tag> = HashMap::new();
        for unit in &quotient_units {
            routes.insert(unit.clone(), seed_term.tag);
        }
        for unit in &covering_units {
            routes.insert(unit.clone(), seed_term.tag);
        }
        let mut seed_spread_routes = Vec::new();
        for unit in spread(self.catalog, seed)? {
            if let Some(target) = seed_term.routes.get(&unit) {
                seed_spread_routes.push((unit.clone(), *target));
                routes.insert(unit.with_space(backbone.clone()), *target);
            }
        }
        let term_baseline = if has_quotient {
            backbone.base.clone().expect("the quotient axis")
        } else {
            backbone.clone()
        };
        let seed_tag = seed_term.tag;
        let term = Term::new(
            self.tag(),
            TermKind::Wrapper {
                kid: Box::new(seed_term),
            },
            backbone.clone(),
            term_baseline,
            routes,
        );

        let Some(trunk_term) = trunk_term else {
            return Ok(term);
        };

        let lkid = self.inject_joints(trunk_term, &joints)?;
        let rkid = term;
        let mut routes = HashMap::new();
        routes.extend(lkid.routes.clone());
        routes.extend(rkid.routes.clone());
        for unit in &quotient_units {
            routes.insert(unit.with_space(quotient_space.clone()), seed_tag);
        }
        for unit in &covering_units {
            routes.insert(unit.with_space(space.clone()), seed_tag);
        }
        for (unit, target) in &seed_spread_routes {
            routes.insert(unit.with_space(space.clone()), *target);
        }
        let baseline = lkid.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Join {
                lkid: Box::new(lkid),
                rkid: Box::new(rkid),
                joints,
                is_left: false,
                is_right: false,
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    fn compile_covering(&mut self, space: &Rc<Space>) -> Result<Term> {
        let seed = space.seed().expect("a covering space has a seed").clone();
        let ground = space.ground().expect("a covering space has a ground").clone();
        let backbone = space.inflate();

        // The seed term, with the baseline at the (inflated) ground.
        let mut baseline = ground.clone();
        while !baseline.is_inflated {
            baseline = baseline.base.clone().expect("an uninflated ground has a base");
        }
        let mut seed_term = self.compile_space(&seed, Some(baseline))?;

        // Extra expressions the seed term must export.
        let mut codes: Vec<Rc<Code>> = Vec::new();
        let mut clip_order: Vec<(Rc<Code>, Direction)> = Vec::new();
        match &space.kind {
            SpaceKind::Forked { kernels, .. } => codes.extend(kernels.iter().cloned()),
            SpaceKind::Attach { images, .. } | SpaceKind::Locator { images, .. } => {
                codes.extend(images.iter().map(|(_, rop)| rop.clone()));
            }
            SpaceKind::Clipped { .. } => {
                // A clipped space orders itself, but only below its base.
                let base = space.base.as_ref().expect("a clipped space has a base");
                for (code, direction) in arrange(self.catalog, &seed, true, true) {
                    if code.units().iter().all(|unit| base.spans(unit.space())) {
                        continue;
                    }
                    codes.push(code.clone());
                    clip_order.push((code, direction));
                }
            }
            _ => {}
        }
        let attach_filter = match &space.kind {
            SpaceKind::Attach { filter, .. } | SpaceKind::Locator { filter, .. } => filter.clone(),
            _ => None,
        };
        if let Some(filter) = &attach_filter {
            codes.push(filter.clone());
        }
        codes.extend(space.companions().iter().cloned());
        seed_term = self.inject(seed_term, &codes)?;

        if let Some(filter) = &attach_filter {
            seed_term = self.wrap_filter(seed_term, filter.clone());
        }

        let is_regular = seed_term.baseline == ground;
        seed_term = self.wrap(seed_term);

        let mut trunk_term: Option<Term> = None;
        let mut joints: Vec<Joint> = Vec::new();
        let mut seed_joints: Vec<Joint> = Vec::new();

        if is_regular {
            if self.baseline != *space {
                let base = space.base.clone().expect("a covering space has a base");
                trunk_term = Some(self.compile_space(&base, None)?);
            }
            // The joints also feed the covering units, so generate them
            // even when there is no trunk to join.
            joints = tie(self.catalog, space)?;
        } else {
            let mut baseline = self.baseline.clone();
            if &baseline == space {
                baseline = baseline.base.clone().expect("a covering space has a base");
            }
            let base = space.base.clone().expect("a covering space has a base");
            let trunk = self.compile_space(&base, Some(baseline))?;
            // A forked seed must keep its own axis free of joints; glue
            // against the ground base instead.
            seed_joints = if matches!(space.kind, SpaceKind::Forked { .. }) {
                let ground_base = ground
                    .base
                    .clone()
                    .expect("a forked ground has a base");
                self.glue_spaces(
                    &trunk.space,
                    &trunk.baseline,
                    &ground_base,
                    &seed_term.baseline,
                )?
            } else {
                self.glue_terms(&trunk, &seed_term)?
            };
            for joint in &seed_joints {
                let unit = Unit::Covering {
                    code: joint.rop.clone(),
                    space: backbone.clone(),
                };
                joints.push(joint.with_rop(unit.into_code()));
            }
            joints.extend(tie(self.catalog, space)?);
            trunk_term = Some(trunk);
        }

        // Slice a clipped space with ROW_NUMBER over the partition.
        if let SpaceKind::Clipped { limit, offset, .. } = &space.kind {
            let mut partition: Vec<Rc<Code>> = Vec::new();
            if !is_regular {
                partition.extend(seed_joints.iter().map(|joint| joint.rop.clone()));
            }
            partition.extend(
                tie(self.catalog, &ground)?
                    .into_iter()
                    .map(|joint| joint.rop),
            );
            seed_term = if !partition.is_empty() {
                self.clip(seed_term, &clip_order, partition, *limit, *offset)?
            } else {
                self.clip_root(seed_term, &clip_order, *limit, *offset)
            };
        }

        // Units exported by the covering term.
        let mut units: Vec<Unit> = Vec::new();
        for unit in seed_term.routes.keys() {
            units.push(Unit::Covering {
                code: unit.clone().into_code(),
                space: backbone.clone(),
            });
        }
        for joint in &joints {
            if let Code::Unit(unit) = &*joint.rop {
                units.push(unit.clone());
            }
        }
        for code in &codes {
            units.push(Unit::Covering {
                code: code.clone(),
                space: backbone.clone(),
            });
        }

        let mut routes: HashMap<Unit, Tag> = HashMap::new();
        for unit in &units {
            routes.insert(unit.clone(), seed_term.tag);
        }
        let mut seed_spread_routes = Vec::new();
        for unit in spread(self.catalog, &seed)? {
            if let Some(target) = seed_term.routes.get(&unit) {
                seed_spread_routes.push((unit.clone(), *target));
                routes.insert(unit.with_space(backbone.clone()), *target);
            }
        }
        let seed_tag = seed_term.tag;
        let term = Term::new(
            self.tag(),
            TermKind::Wrapper {
                kid: Box::new(seed_term),
            },
            backbone.clone(),
            backbone.clone(),
            routes,
        );

        let Some(trunk_term) = trunk_term else {
            return Ok(term);
        };

        let lkid = self.inject_joints(trunk_term, &joints)?;
        let rkid = term;
        let mut routes = HashMap::new();
        routes.extend(lkid.routes.clone());
        routes.extend(rkid.routes.clone());
        for unit in &units {
            routes.insert(unit.with_space(space.clone()), seed_tag);
        }
        for (unit, target) in &seed_spread_routes {
            routes.insert(unit.with_space(space.clone()), *target);
        }
        let baseline = lkid.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Join {
                lkid: Box::new(lkid),
                rkid: Box::new(rkid),
                joints,
                is_left: false,
                is_right: false,
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    /// `ROW_NUMBER() OVER (PARTITION BY ... ORDER BY ...)` slicing of a
    /// partitioned seed.
    fn clip(
        &mut self,
        term: Term,
        order: &[(Rc<Code>, Direction)],
        partition: Vec<Rc<Code>>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Term> {
        let mut arguments = partition.clone();
        let order_count = order.len();
        for (code, direction) in order {
            arguments.push(Code::formula(
                Signature::SortDirection {
                    direction: *direction,
                },
                code.domain().clone(),
                vec![code.clone()],
            ));
        }
        let row_number = Code::formula(
            Signature::RowNumber {
                partition: partition.len(),
                order: order_count,
            },
            Domain::Integer,
            arguments,
        );
        let unit_space = term
            .space
            .base
            .clone()
            .expect("a clipped seed space has a base");
        let row_number_unit = Unit::Scalar {
            code: row_number,
            space: unit_space,
            companions: Vec::new(),
        };
        let tag = self.tag();
        let mut routes = term.routes.clone();
        routes.insert(row_number_unit.clone(), tag);
        let space = term.space.clone();
        let baseline = term.baseline.clone();
        let term = Term::new(
            tag,
            TermKind::Permanent {
                kid: Box::new(term),
            },
            space,
            baseline,
            routes,
        );
        let left_bound = offset.map_or(1, |offset| offset + 1);
        let right_bound = match limit {
            Some(limit) => left_bound + limit,
            None => left_bound + 1,
        };
        let rn = row_number_unit.into_code();
        let filter = Code::conjoin(vec![
            Code::formula(
                Signature::Compare {
                    relation: crate::tr::signature::Relation::Ge,
                },
                Domain::Boolean,
                vec![rn.clone(), Code::integer_literal(left_bound as i64)],
            ),
            Code::formula(
                Signature::Compare {
                    relation: crate::tr::signature::Relation::Lt,
                },
                Domain::Boolean,
                vec![rn, Code::integer_literal(right_bound as i64)],
            ),
        ]);
        Ok(self.wrap_filter(term, filter))
    }

    /// Slicing against the root partition is a plain ORDER/LIMIT.
    fn clip_root(
        &mut self,
        term: Term,
        order: &[(Rc<Code>, Direction)],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Term {
        let limit = limit.or(Some(1));
        let space = term.space.clone();
        let baseline = term.baseline.clone();
        let routes = term.routes.clone();
        Term::new(
            self.tag(),
            TermKind::Order {
                kid: Box::new(term),
                order: order.to_vec(),
                limit,
                offset,
            },
            space,
            baseline,
            routes,
        )
    }

    fn compile_filtered(&mut self, space: &Rc<Space>) -> Result<Term> {
        let SpaceKind::Filtered { filter } = &space.kind else {
            unreachable!();
        };
        let backbone = space.inflate();
        let base = space.base.clone().expect("a filtered space has a base");
        let term = self.compile_space(&base, None)?;
        let kid = self.inject(term, std::slice::from_ref(filter))?;
        let mut routes = kid.routes.clone();
        for unit in spread(self.catalog, space)? {
            let target = *routes
                .get(&unit.with_space(backbone.clone()))
                .expect("the backbone is exported");
            routes.insert(unit, target);
        }
        let baseline = kid.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Filter {
                kid: Box::new(kid),
                filter: filter.clone(),
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    fn compile_ordered(&mut self, space: &Rc<Space>) -> Result<Term> {
        let SpaceKind::Ordered { limit, offset, .. } = &space.kind else {
            unreachable!();
        };
        let backbone = space.inflate();
        let base = space.base.clone().expect("an ordered space has a base");

        // Without a slice, ordering is a no-op for the term tree: terms
        // are not required to respect the space ordering.
        if space.is_expanding {
            let term = self.compile_space(&base, None)?;
            let mut routes = term.routes.clone();
            for unit in spread(self.catalog, space)? {
                let target = *routes
                    .get(&unit.with_space(backbone.clone()))
                    .expect("the backbone is exported");
                routes.insert(unit, target);
            }
            let baseline = term.baseline.clone();
            return Ok(Term::new(
                self.tag(),
                TermKind::Wrapper {
                    kid: Box::new(term),
                },
                space.clone(),
                baseline,
                routes,
            ));
        }

        // Slicing relies on precise row numbering: rebuild the base from
        // the root baseline and order it explicitly.
        let order = arrange(self.catalog, space, true, true);
        let codes: Vec<Rc<Code>> = order.iter().map(|(code, _)| code.clone()).collect();
        let kid = self.compile_space(&base, Some(self.root.clone()))?;
        let kid = self.inject(kid, &codes)?;
        let mut routes = kid.routes.clone();
        for unit in spread(self.catalog, space)? {
            let target = *routes
                .get(&unit.with_space(backbone.clone()))
                .expect("the backbone is exported");
            routes.insert(unit, target);
        }
        let baseline = kid.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Order {
                kid: Box::new(kid),
                order,
                limit: *limit,
                offset: *offset,
            },
            space.clone(),
            baseline,
            routes,
        ))
    }

    // -- unit injectors --------------------------------------------------

    fn inject_unit(&mut self, term: Term, unit: &Unit) -> Result<Term> {
        match unit {
            Unit::Column { space, .. } => {
                if !term.space.spans(space) {
                    return Err(Error::simple("expected a singular expression").into());
                }
                self.inject_space(term, space)
            }
            Unit::Scalar { .. } => self.inject_scalar(term, unit),
            Unit::Aggregate { .. } => self.inject_aggregate(term, unit),
            Unit::Correlated { .. } => self.inject_correlated(term, unit),
            Unit::Kernel { space, .. } => {
                if !term.space.spans(space) {
                    return Err(Error::simple("expected a singular expression").into());
                }
                // Injecting the quotient space provides the kernel.
                let term = self.inject_space(term, space)?;
                debug_assert!(term.routes.contains_key(unit));
                Ok(term)
            }
            Unit::Covering { code, space } => {
                if !term.space.spans(space) {
                    return Err(Error::simple("expected a singular expression").into());
                }
                // Hint the space to export the unit when its term is
                // compiled, then attach the term manually.
                let mut companions = space.companions().to_vec();
                companions.push(code.clone());
                let hinted = space.with_companions(companions);
                let space_term = self.compile_shoot(&hinted, &term.space.clone(), None)?;
                let target = *space_term
                    .routes
                    .get(unit)
                    .expect("the hinted term exports the covering unit");
                let mut extra_routes = HashMap::new();
                extra_routes.insert(unit.clone(), target);
                let term = self.join_terms(term, space_term, extra_routes)?;
                debug_assert!(term.routes.contains_key(unit));
                Ok(term)
            }
        }
    }

    /// Grows the term to export the given space.
    fn inject_space(&mut self, term: Term, space: &Rc<Space>) -> Result<Term> {
        debug_assert!(term.space.spans(space));
        if spread(self.catalog, space)?
            .iter()
            .all(|unit| term.routes.contains_key(unit))
        {
            return Ok(term);
        }
        debug_assert_eq!(space, &space.prune(&term.space));

        // The space may be an ancestor of the term space cut off by the
        // term baseline; grow the missing axes back.
        if term.space.concludes(space) {
            let baseline_base = term
                .baseline
                .base
                .clone()
                .expect("the baseline lies above the space");
            let lkid = self.compile_space(&baseline_base, Some(space.clone()))?;
            let joints = tie(self.catalog, &term.baseline)?;
            let lkid = self.inject_joints(lkid, &joints)?;
            let mut routes = HashMap::new();
            routes.extend(lkid.routes.clone());
            routes.extend(term.routes.clone());
            let space = term.space.clone();
            let baseline = lkid.baseline.clone();
            return Ok(Term::new(
                self.tag(),
                TermKind::Join {
                    lkid: Box::new(lkid),
                    rkid: Box::new(term),
                    joints,
                    is_left: false,
                    is_right: false,
                },
                space,
                baseline,
                routes,
            ));
        }

        // Otherwise grow a shoot and attach it.
        let space_term = self.compile_shoot(space, &term.space.clone(), None)?;
        let mut extra_routes = HashMap::new();
        for unit in spread(self.catalog, space)? {
            let target = *space_term
                .routes
                .get(&unit)
                .expect("a shoot exports its native units");
            extra_routes.insert(unit, target);
        }
        self.join_terms(term, space_term, extra_routes)
    }

    fn inject_scalar(&mut self, term: Term, unit: &Unit) -> Result<Term> {
        let Unit::Scalar {
            space, companions, ..
        } = unit
        else {
            unreachable!();
        };
        // The whole companion batch is injected together.
        let mut units = vec![unit.clone()];
        for code in companions {
            let companion = Unit::Scalar {
                code: code.clone(),
                space: space.clone(),
                companions: Vec::new(),
            };
            if !term.routes.contains_key(&companion) {
                units.push(companion);
            }
        }
        if !term.space.spans(space) {
            return Err(Error::simple("expected a singular expression").into());
        }
        let codes: Vec<Rc<Code>> = units
            .iter()
            .map(|unit| unit.code().expect("a scalar unit has a code").clone())
            .collect();

        // A dominating unit space can be evaluated in the main term.
        if space.dominates(&term.space) {
            let term = self.inject(term, &codes)?;
            let tag = self.tag();
            let mut routes = term.routes.clone();
            for unit in &units {
                routes.insert(unit.clone(), tag);
            }
            let space = term.space.clone();
            let baseline = term.baseline.clone();
            return Ok(Term::new(
                tag,
                TermKind::Wrapper {
                    kid: Box::new(term),
                },
                space,
                baseline,
                routes,
            ));
        }

        let mut unit_term = self.compile_shoot(space, &term.space.clone(), Some(&codes))?;
        // Arbitrary expressions cannot be exported from a terminal frame.
        if unit_term.is_nullary() {
            unit_term = self.wrap(unit_term);
        }
        let mut extra_routes = HashMap::new();
        for unit in &units {
            extra_routes.insert(unit.clone(), unit_term.tag);
        }
        for unit in spread(self.catalog, space)? {
            if let Some(target) = unit_term.routes.get(&unit) {
                extra_routes.insert(unit, *target);
            }
        }
        self.join_terms(term, unit_term, extra_routes)
    }

    fn inject_aggregate(&mut self, term: Term, unit: &Unit) -> Result<Term> {
        let Unit::Aggregate {
            space,
            plural_space,
            companions,
            ..
        } = unit
        else {
            unreachable!();
        };
        let mut units = vec![unit.clone()];
        for code in companions {
            let companion = Unit::Aggregate {
                code: code.clone(),
                plural_space: plural_space.clone(),
                space: space.clone(),
                companions: Vec::new(),
            };
            if !term.routes.contains_key(&companion) {
                units.push(companion);
            }
        }
        if !term.space.spans(space) {
            return Err(Error::simple("expected a singular expression").into());
        }
        let codes: Vec<Rc<Code>> = units
            .iter()
            .map(|unit| unit.code().expect("an aggregate unit has a code").clone())
            .collect();

        // The unit is native when its space dominates the term space or
        // one of its ancestors; the projection then attaches directly to
        // the main term.
        let mut attach_point: Option<Rc<Space>> = None;
        let mut cursor = Some(term.space.clone());
        while let Some(candidate) = cursor {
            if space.dominates(&candidate) {
                attach_point = Some(candidate);
                break;
            }
            cursor = candidate.base.clone();
        }

        if let Some(unit_space) = attach_point {
            let unit_baseline = term.baseline.clone();
            self.attach_aggregate(term, &unit_space, &unit_baseline, &units, &codes, plural_space)
        } else {
            let unit_term = self.compile_shoot(space, &term.space.clone(), None)?;
            let unit_space = unit_term.space.clone();
            let unit_baseline = unit_term.baseline.clone();
            let unit_term = self.attach_aggregate(
                unit_term,
                &unit_space,
                &unit_baseline,
                &units,
                &codes,
                plural_space,
            )?;
            let projected_tag = *unit_term
                .routes
                .get(&units[0])
                .expect("the aggregate was attached");
            let mut extra_routes = HashMap::new();
            for unit in &units {
                extra_routes.insert(unit.clone(), projected_tag);
            }
            self.join_terms(term, unit_term, extra_routes)
        }
    }

    fn attach_aggregate(
        &mut self,
        unit_term: Term,
        unit_space: &Rc<Space>,
        unit_baseline: &Rc<Space>,
        units: &[Unit],
        codes: &[Rc<Code>],
        plural_space: &Rc<Space>,
    ) -> Result<Term> {
        // The plural term evaluates the aggregate arguments.
        let plural_term = self.compile_shoot(plural_space, unit_space, Some(codes))?;
        let unit_joints = self.glue_spaces(
            unit_space,
            unit_baseline,
            &plural_term.space,
            &plural_term.baseline,
        )?;
        let unit_term = self.inject_joints(unit_term, &unit_joints)?;

        // Project the plural term onto the join basis; the projected
        // space is a quotient with an empty kernel.
        let basis: Vec<Rc<Code>> = unit_joints.iter().map(|joint| joint.rop.clone()).collect();
        let projected_space = Space::quotient(
            unit_space.inflate(),
            plural_space.clone(),
            Vec::new(),
        );
        let tag = self.tag();
        let mut joints = Vec::new();
        let mut routes = HashMap::new();
        for joint in &unit_joints {
            let rop = Unit::Kernel {
                code: joint.rop.clone(),
                space: projected_space.clone(),
            };
            routes.insert(rop.clone(), tag);
            joints.push(joint.with_rop(rop.into_code()));
        }
        let projected_term = Term::new(
            tag,
            TermKind::Projection {
                kid: Box::new(plural_term),
                kernels: basis,
            },
            projected_space.clone(),
            projected_space.clone(),
            routes,
        );

        // An inner join would drop unit rows with no plural partners.
        let is_left = !projected_space.dominates(&unit_term.space);
        let mut routes = unit_term.routes.clone();
        for unit in units {
            routes.insert(unit.clone(), projected_term.tag);
        }
        let space = unit_term.space.clone();
        let baseline = unit_term.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Join {
                lkid: Box::new(unit_term),
                rkid: Box::new(projected_term),
                joints,
                is_left,
                is_right: false,
            },
            space,
            baseline,
            routes,
        ))
    }

    fn inject_correlated(&mut self, term: Term, unit: &Unit) -> Result<Term> {
        let Unit::Correlated {
            code,
            plural_space,
            space,
        } = unit
        else {
            unreachable!();
        };
        if !term.space.spans(space) {
            return Err(Error::simple("expected a singular expression").into());
        }
        // Correlated units are always wrapped by a scalar unit over the
        // same space, so the unit is native to the term.
        debug_assert!(space.dominates(&term.space));
        let unit_term = term;

        let unit_codes = [code.clone()];
        let plural_term =
            self.compile_shoot(plural_space, &unit_term.space.clone(), Some(&unit_codes[..]))?;
        let joints = self.glue_terms(&unit_term, &plural_term)?;
        let unit_term = self.inject_joints(unit_term, &joints)?;

        let mut correlations = Vec::new();
        let mut filters = Vec::new();
        for joint in &joints {
            correlations.push(joint.lop.clone());
            let lop = Rc::new(Code::Correlation {
                code: joint.lop.clone(),
            });
            filters.push(Code::formula(
                Signature::IsEqual {
                    polarity: Polarity::Positive,
                },
                Domain::Boolean,
                vec![lop, joint.rop.clone()],
            ));
        }
        let plural_term = if filters.is_empty() {
            plural_term
        } else {
            let filter = Code::conjoin(filters);
            self.wrap_filter(plural_term, filter)
        };
        let plural_space_term = plural_term.space.clone();
        let plural_baseline = plural_term.baseline.clone();
        let plural_routes = plural_term.routes.clone();
        let plural_term = Term::new(
            self.tag(),
            TermKind::Correlation {
                kid: Box::new(plural_term),
            },
            plural_space_term,
            plural_baseline,
            plural_routes,
        );

        let mut routes = unit_term.routes.clone();
        routes.insert(unit.clone(), plural_term.tag);
        let space = unit_term.space.clone();
        let baseline = unit_term.baseline.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Embedding {
                lkid: Box::new(unit_term),
                rkid: Box::new(plural_term),
                correlations,
            },
            space,
            baseline,
            routes,
        ))
    }

    // -- segments --------------------------------------------------------

    pub fn compile_segment(&mut self, segment: &Rc<SegmentExpr>) -> Result<Term> {
        if !self.superspace.spans(&segment.root) {
            return Err(Error::simple("expected a singular expression").into());
        }
        let mut chain: Vec<Rc<Space>> = self.superspace_stack.clone();
        chain.push(self.superspace.clone());
        chain.push(segment.root.clone());
        chain.push(segment.space.clone());

        // The segment ordering must respect the orderings of the parent
        // segments.
        let mut order: Vec<(Rc<Code>, Direction)> = Vec::new();
        let mut duplicates = std::collections::HashSet::new();
        for space in &chain {
            for (code, direction) in arrange(self.catalog, space, true, true) {
                if duplicates.contains(&code) {
                    continue;
                }
                duplicates.insert(code.clone());
                order.push((code, direction));
            }
        }

        let mut codes: Vec<Rc<Code>> = segment.codes.clone();
        codes.extend(order.iter().map(|(code, _)| code.clone()));

        // Prune chain spaces native to (dominated by an ancestor of)
        // their successor.
        let mut idx = 0;
        while idx + 1 < chain.len() {
            let parent_space = chain[idx].clone();
            let mut is_native = false;
            let mut cursor = Some(chain[idx + 1].clone());
            while let Some(child) = cursor {
                if parent_space.dominates(&child) {
                    is_native = true;
                    break;
                }
                cursor = child.base.clone();
            }
            if is_native {
                chain.remove(idx);
                idx = idx.saturating_sub(1);
            } else {
                idx += 1;
            }
        }

        // Join the remaining chain left to right at the root baseline.
        let mut trunk_term = self.compile_space(&chain[0], Some(self.root.clone()))?;
        for space in &chain[1..] {
            let shoot_term = self.compile_shoot(space, &trunk_term.space.clone(), None)?;
            let joints = self.glue_terms(&trunk_term, &shoot_term)?;
            trunk_term = self.inject_joints(trunk_term, &joints)?;
            let mut routes = HashMap::new();
            routes.extend(trunk_term.routes.clone());
            routes.extend(shoot_term.routes.clone());
            let space = shoot_term.space.clone();
            trunk_term = Term::new(
                self.tag(),
                TermKind::Join {
                    lkid: Box::new(trunk_term),
                    rkid: Box::new(shoot_term),
                    joints,
                    is_left: false,
                    is_right: false,
                },
                space,
                self.root.clone(),
                routes,
            );
        }

        // The compiler does not guarantee the term respects the space
        // ordering; the segment term orders its own rows so the merge
        // keys of nested segments line up.
        let kid = self.inject(trunk_term, &codes)?;

        // Nested segments compile under the extended superspace chain;
        // duplicates share one compiled tree.
        let mut compiled: Vec<(Rc<SegmentExpr>, Rc<Term>)> = Vec::new();
        let mut dependents: Vec<Rc<Term>> = Vec::new();
        for dependent in &segment.dependents {
            if let Some((_, term)) = compiled
                .iter()
                .find(|(expr, _)| expr.as_ref() == dependent.as_ref())
            {
                dependents.push(term.clone());
                continue;
            }
            self.push_superspace(segment.root.clone());
            self.push_superspace(segment.space.clone());
            let term = self.compile_segment(dependent);
            self.pop_superspace();
            self.pop_superspace();
            let term = Rc::new(term?);
            compiled.push((dependent.clone(), term.clone()));
            dependents.push(term);
        }

        // Keys for merging nested segment results.
        let superkeys: Vec<Rc<Code>> = arrange(self.catalog, &self.superspace.clone(), false, true)
            .into_iter()
            .map(|(code, _)| code)
            .collect();
        let keys: Vec<Rc<Code>> = arrange(self.catalog, &segment.space, false, true)
            .into_iter()
            .map(|(code, _)| code)
            .collect();

        let space = kid.space.clone();
        let baseline = kid.baseline.clone();
        let routes = kid.routes.clone();
        Ok(Term::new(
            self.tag(),
            TermKind::Segment {
                kid: Box::new(kid),
                codes: segment.codes.clone(),
                superkeys,
                keys,
                order,
                dependents,
                expr: segment.clone(),
            },
            space,
            baseline,
            routes,
        ))
    }

    // -- helpers ---------------------------------------------------------

    fn wrap(&mut self, term: Term) -> Term {
        let space = term.space.clone();
        let baseline = term.baseline.clone();
        let routes = term.routes.clone();
        Term::new(
            self.tag(),
            TermKind::Wrapper {
                kid: Box::new(term),
            },
            space,
            baseline,
            routes,
        )
    }

    fn wrap_filter(&mut self, term: Term, filter: Rc<Code>) -> Term {
        let space = term.space.clone();
        let baseline = term.baseline.clone();
        let routes = term.routes.clone();
        Term::new(
            self.tag(),
            TermKind::Filter {
                kid: Box::new(term),
                filter,
            },
            space,
            baseline,
            routes,
        )
    }
}

/// Compiles a rewritten segment expression into a term tree.
pub fn compile(segment: &Rc<SegmentExpr>, catalog: &Catalog) -> Result<Term> {
    log::debug!("compiling the term tree");
    let mut state = CompilingState::new(catalog);
    guard(segment.flow.span, || state.compile_segment(segment))
}
