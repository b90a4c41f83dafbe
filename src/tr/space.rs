//! The space lattice and the code algebra.
//!
//! A *space* is a lazy sequence-of-sequences: for every row of its base
//! space it yields zero or more rows.  A space is described by the chain
//! of operations that produce it from the root space; axial operations
//! introduce new rows, non-axial ones reorder or discard rows of the
//! base.  The derived relations (`spans`, `dominates`, `conforms`,
//! `concludes`) compare spaces by walking and matching these chains.
//!
//! A *code* is a scalar-valued expression over spaces; *units* are the
//! elementary space-indexed codes out of which every other code is
//! composed.
//!
//! All nodes here are immutable, shared through `Rc`, and compared by
//! value over their defining attributes.  Companion lists are
//! compilation hints and do not participate in equality or hashing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem::discriminant;
use std::rc::Rc;

use once_cell::unsync::OnceCell;

use crate::catalog::{ColumnRef, Join, TableRef};
use crate::domain::{Domain, Value};
use crate::syntax::Direction;
use crate::tr::flow::Flow;
use crate::tr::signature::{Polarity, Signature};

/// The value family of a space.
#[derive(Debug, Clone)]
pub enum Family {
    Scalar,
    Table(TableRef),
    Quotient {
        seed: Rc<Space>,
        ground: Rc<Space>,
        kernels: Vec<Rc<Code>>,
    },
}

impl Family {
    pub fn is_scalar(&self) -> bool {
        matches!(self, Family::Scalar)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Family::Table(_))
    }

    pub fn is_quotient(&self) -> bool {
        matches!(self, Family::Quotient { .. })
    }

    pub fn table(&self) -> Option<TableRef> {
        match self {
            Family::Table(table) => Some(*table),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Space {
    pub base: Option<Rc<Space>>,
    pub kind: SpaceKind,
    pub family: Family,
    pub is_contracting: bool,
    pub is_expanding: bool,
    /// The space and all its ancestors are axial.
    pub is_inflated: bool,
    hash: OnceCell<u64>,
}

#[derive(Debug, Clone, strum::AsRefStr)]
pub enum SpaceKind {
    Root,
    Scalar,
    DirectTable {
        table: TableRef,
    },
    FiberTable {
        join: Join,
    },
    Quotient {
        seed: Rc<Space>,
        ground: Rc<Space>,
        kernels: Vec<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    },
    Complement {
        seed: Rc<Space>,
        ground: Rc<Space>,
        kernels: Vec<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    },
    Moniker {
        seed: Rc<Space>,
        ground: Rc<Space>,
        companions: Vec<Rc<Code>>,
    },
    Forked {
        seed: Rc<Space>,
        ground: Rc<Space>,
        kernels: Vec<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    },
    Attach {
        seed: Rc<Space>,
        ground: Rc<Space>,
        images: Vec<(Rc<Code>, Rc<Code>)>,
        filter: Option<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    },
    Locator {
        seed: Rc<Space>,
        ground: Rc<Space>,
        images: Vec<(Rc<Code>, Rc<Code>)>,
        filter: Option<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    },
    Clipped {
        seed: Rc<Space>,
        ground: Rc<Space>,
        limit: Option<usize>,
        offset: Option<usize>,
        companions: Vec<Rc<Code>>,
    },
    Filtered {
        filter: Rc<Code>,
    },
    Ordered {
        order: Vec<(Rc<Code>, Direction)>,
        limit: Option<usize>,
        offset: Option<usize>,
    },
}

impl SpaceKind {
    /// An axial operation produces rows that are not necessarily rows
    /// of its base.
    pub fn is_axis(&self) -> bool {
        use SpaceKind::*;
        matches!(
            self,
            Root | Scalar
                | DirectTable { .. }
                | FiberTable { .. }
                | Quotient { .. }
                | Complement { .. }
                | Moniker { .. }
                | Forked { .. }
                | Attach { .. }
                | Locator { .. }
                | Clipped { .. }
        )
    }
}

impl Space {
    fn build(
        base: Option<Rc<Space>>,
        kind: SpaceKind,
        family: Family,
        is_contracting: bool,
        is_expanding: bool,
    ) -> Rc<Space> {
        let is_inflated = match &base {
            None => true,
            Some(base) => base.is_inflated && kind.is_axis(),
        };
        Rc::new(Space {
            base,
            kind,
            family,
            is_contracting,
            is_expanding,
            is_inflated,
            hash: OnceCell::new(),
        })
    }

    /// The unique space with no base; contains exactly one empty row.
    pub fn root() -> Rc<Space> {
        Space::build(None, SpaceKind::Root, Family::Scalar, false, false)
    }

    /// A link back to the scalar class.
    pub fn scalar(base: Rc<Space>) -> Rc<Space> {
        Space::build(Some(base), SpaceKind::Scalar, Family::Scalar, true, true)
    }

    /// A full cross product with the rows of a table.
    pub fn direct_table(base: Rc<Space>, table: TableRef) -> Rc<Space> {
        Space::build(
            Some(base),
            SpaceKind::DirectTable { table },
            Family::Table(table),
            false,
            false,
        )
    }

    /// Rows of a linked table; cardinality inherited from the join.
    pub fn fiber_table(base: Rc<Space>, join: Join) -> Rc<Space> {
        let family = Family::Table(join.target);
        let is_contracting = join.is_contracting;
        let is_expanding = join.is_expanding;
        Space::build(
            Some(base),
            SpaceKind::FiberTable { join },
            family,
            is_contracting,
            is_expanding,
        )
    }

    pub fn quotient(base: Rc<Space>, seed: Rc<Space>, kernels: Vec<Rc<Code>>) -> Rc<Space> {
        Space::quotient_with(base, seed, kernels, Vec::new())
    }

    /// One row per distinct kernel tuple running the seed over the base.
    pub fn quotient_with(
        base: Rc<Space>,
        seed: Rc<Space>,
        kernels: Vec<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    ) -> Rc<Space> {
        // The closest axial ancestor of the seed spanned by the base.
        let mut ground = seed.clone();
        while !matches!(&ground.base, Some(gbase) if base.spans(gbase)) {
            match ground.base.clone() {
                Some(gbase) => ground = gbase,
                None => break,
            }
        }
        let is_contracting = kernels.is_empty();
        // Required by the assembler to collapse a scalar projection into
        // the segment frame.
        let is_expanding = base.is_root() && kernels.is_empty();
        let family = Family::Quotient {
            seed: seed.clone(),
            ground: ground.clone(),
            kernels: kernels.clone(),
        };
        Space::build(
            Some(base),
            SpaceKind::Quotient {
                seed,
                ground,
                kernels,
                companions,
            },
            family,
            is_contracting,
            is_expanding,
        )
    }

    pub fn complement(base: Rc<Space>) -> Rc<Space> {
        Space::complement_with(base, Vec::new())
    }

    /// The axial inverse of a quotient; reseeds the quotient.
    pub fn complement_with(base: Rc<Space>, companions: Vec<Rc<Code>>) -> Rc<Space> {
        let Family::Quotient {
            seed,
            ground,
            kernels,
        } = base.family.clone()
        else {
            panic!("complement of a non-quotient space");
        };
        let family = seed.family.clone();
        Space::build(
            Some(base),
            SpaceKind::Complement {
                seed,
                ground,
                kernels,
                companions,
            },
            family,
            false,
            true,
        )
    }

    /// Masks an arbitrary chain of operations as one axial operation.
    pub fn moniker(base: Rc<Space>, seed: Rc<Space>, companions: Vec<Rc<Code>>) -> Rc<Space> {
        let ground = Space::covering_ground(&base, &seed);
        let family = seed.family.clone();
        let is_contracting = base.spans(&seed);
        let is_expanding = seed.dominates(&base);
        Space::build(
            Some(base),
            SpaceKind::Moniker {
                seed,
                ground,
                companions,
            },
            family,
            is_contracting,
            is_expanding,
        )
    }

    /// Associates each base row with the rows sharing its origin and
    /// kernel values.
    pub fn forked(
        base: Rc<Space>,
        seed: Rc<Space>,
        kernels: Vec<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    ) -> Rc<Space> {
        let mut ground = seed.clone();
        while !ground.is_axis() {
            ground = ground.base.clone().expect("a forked seed above the root");
        }
        let is_contracting = ground.is_contracting;
        let is_expanding = kernels.is_empty() && seed.dominates(&base);
        let family = base.family.clone();
        Space::build(
            Some(base),
            SpaceKind::Forked {
                seed,
                ground,
                kernels,
                companions,
            },
            family,
            is_contracting,
            is_expanding,
        )
    }

    /// Links each base row to convergent seed rows with equal images.
    pub fn attach(
        base: Rc<Space>,
        seed: Rc<Space>,
        images: Vec<(Rc<Code>, Rc<Code>)>,
        filter: Option<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    ) -> Rc<Space> {
        let mut ground = seed.clone();
        while !matches!(&ground.base, Some(gbase) if base.spans(gbase)) {
            match ground.base.clone() {
                Some(gbase) => ground = gbase,
                None => break,
            }
        }
        let family = seed.family.clone();
        Space::build(
            Some(base),
            SpaceKind::Attach {
                seed,
                ground,
                images,
                filter,
                companions,
            },
            family,
            false,
            false,
        )
    }

    /// Row lookup by identity values.
    pub fn locator(
        base: Rc<Space>,
        seed: Rc<Space>,
        images: Vec<(Rc<Code>, Rc<Code>)>,
        filter: Option<Rc<Code>>,
        companions: Vec<Rc<Code>>,
    ) -> Rc<Space> {
        let ground = Space::covering_ground(&base, &seed);
        let mut axis = seed.clone();
        while !axis.is_axis() {
            axis = axis.base.clone().expect("a locator seed above the root");
        }
        let is_contracting = match &axis.base {
            None => true,
            Some(abase) => base.spans(abase),
        };
        let family = seed.family.clone();
        Space::build(
            Some(base),
            SpaceKind::Locator {
                seed,
                ground,
                images,
                filter,
                companions,
            },
            family,
            is_contracting,
            false,
        )
    }

    /// A slice of the seed rows per base row.
    pub fn clipped(
        base: Rc<Space>,
        seed: Rc<Space>,
        limit: Option<usize>,
        offset: Option<usize>,
        companions: Vec<Rc<Code>>,
    ) -> Rc<Space> {
        let mut ground = seed.clone();
        while !ground.is_axis() {
            ground = ground.base.clone().expect("a clipped seed above the root");
        }
        while !matches!(&ground.base, Some(gbase) if base.spans(gbase)) {
            match ground.base.clone() {
                Some(gbase) => ground = gbase,
                None => break,
            }
        }
        let is_contracting = limit.is_none();
        let is_expanding =
            seed.dominates(&base) && offset.is_none() && limit.map_or(true, |limit| limit > 0);
        let family = seed.family.clone();
        Space::build(
            Some(base),
            SpaceKind::Clipped {
                seed,
                ground,
                limit,
                offset,
                companions,
            },
            family,
            is_contracting,
            is_expanding,
        )
    }

    /// Rows of the base satisfying a predicate.
    pub fn filtered(base: Rc<Space>, filter: Rc<Code>) -> Rc<Space> {
        let family = base.family.clone();
        Space::build(
            Some(base),
            SpaceKind::Filtered { filter },
            family,
            true,
            false,
        )
    }

    /// Reordered and optionally sliced rows of the base.
    pub fn ordered(
        base: Rc<Space>,
        order: Vec<(Rc<Code>, Direction)>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Rc<Space> {
        let family = base.family.clone();
        let is_expanding = limit.is_none() && offset.is_none();
        Space::build(
            Some(base),
            SpaceKind::Ordered {
                order,
                limit,
                offset,
            },
            family,
            true,
            is_expanding,
        )
    }

    // An axial ancestor of the seed spanned by the base; may be the seed
    // itself.
    fn covering_ground(base: &Rc<Space>, seed: &Rc<Space>) -> Rc<Space> {
        let mut ground = seed.clone();
        while !ground.is_axis() {
            ground = ground.base.clone().expect("a covering seed above the root");
        }
        if !base.spans(&ground) {
            while !matches!(&ground.base, Some(gbase) if base.spans(gbase)) {
                match ground.base.clone() {
                    Some(gbase) => ground = gbase,
                    None => break,
                }
            }
        }
        ground
    }

    pub fn is_axis(&self) -> bool {
        self.kind.is_axis()
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, SpaceKind::Root)
    }

    /// A non-commutative operation cannot be pruned or reordered against
    /// other operations.
    pub fn is_commutative(&self) -> bool {
        match &self.kind {
            SpaceKind::Ordered { limit, offset, .. } => limit.is_none() && offset.is_none(),
            _ => true,
        }
    }

    pub fn seed(&self) -> Option<&Rc<Space>> {
        use SpaceKind::*;
        match &self.kind {
            Quotient { seed, .. }
            | Complement { seed, .. }
            | Moniker { seed, .. }
            | Forked { seed, .. }
            | Attach { seed, .. }
            | Locator { seed, .. }
            | Clipped { seed, .. } => Some(seed),
            _ => None,
        }
    }

    pub fn ground(&self) -> Option<&Rc<Space>> {
        use SpaceKind::*;
        match &self.kind {
            Quotient { ground, .. }
            | Complement { ground, .. }
            | Moniker { ground, .. }
            | Forked { ground, .. }
            | Attach { ground, .. }
            | Locator { ground, .. }
            | Clipped { ground, .. } => Some(ground),
            _ => None,
        }
    }

    pub fn kernels(&self) -> &[Rc<Code>] {
        use SpaceKind::*;
        match &self.kind {
            Quotient { kernels, .. } | Complement { kernels, .. } | Forked { kernels, .. } => {
                kernels
            }
            _ => &[],
        }
    }

    /// The kernel expressions of the quotient family; non-axial
    /// operations over a quotient keep the family of their base.
    pub fn quotient_kernels(&self) -> &[Rc<Code>] {
        match &self.family {
            Family::Quotient { kernels, .. } => kernels,
            _ => &[],
        }
    }

    pub fn companions(&self) -> &[Rc<Code>] {
        use SpaceKind::*;
        match &self.kind {
            Quotient { companions, .. }
            | Complement { companions, .. }
            | Moniker { companions, .. }
            | Forked { companions, .. }
            | Attach { companions, .. }
            | Locator { companions, .. }
            | Clipped { companions, .. } => companions,
            _ => &[],
        }
    }

    /// Rebuilds the node on a new base, recomputing the derived
    /// attributes (ground, cardinality flags, inflation).
    pub fn clone_with_base(&self, base: Option<Rc<Space>>) -> Rc<Space> {
        use SpaceKind::*;
        let base = base.unwrap_or_else(Space::root);
        match &self.kind {
            Root => Space::root(),
            Scalar => Space::scalar(base),
            DirectTable { table } => Space::direct_table(base, *table),
            FiberTable { join } => Space::fiber_table(base, join.clone()),
            Quotient {
                seed,
                kernels,
                companions,
                ..
            } => Space::quotient_with(base, seed.clone(), kernels.clone(), companions.clone()),
            Complement { companions, .. } => Space::complement_with(base, companions.clone()),
            Moniker {
                seed, companions, ..
            } => Space::moniker(base, seed.clone(), companions.clone()),
            Forked {
                seed,
                kernels,
                companions,
                ..
            } => Space::forked(base, seed.clone(), kernels.clone(), companions.clone()),
            Attach {
                seed,
                images,
                filter,
                companions,
                ..
            } => Space::attach(
                base,
                seed.clone(),
                images.clone(),
                filter.clone(),
                companions.clone(),
            ),
            Locator {
                seed,
                images,
                filter,
                companions,
                ..
            } => Space::locator(
                base,
                seed.clone(),
                images.clone(),
                filter.clone(),
                companions.clone(),
            ),
            Clipped {
                seed,
                limit,
                offset,
                companions,
                ..
            } => Space::clipped(base, seed.clone(), *limit, *offset, companions.clone()),
            Filtered { filter } => Space::filtered(base, filter.clone()),
            Ordered {
                order,
                limit,
                offset,
            } => Space::ordered(base, order.clone(), *limit, *offset),
        }
    }

    /// Replaces the companion hints; equality is unaffected.
    pub fn with_companions(&self, companions: Vec<Rc<Code>>) -> Rc<Space> {
        use SpaceKind::*;
        let base = self.base.clone().unwrap_or_else(Space::root);
        match &self.kind {
            Quotient { seed, kernels, .. } => {
                Space::quotient_with(base, seed.clone(), kernels.clone(), companions)
            }
            Complement { .. } => Space::complement_with(base, companions),
            Moniker { seed, .. } => Space::moniker(base, seed.clone(), companions),
            Forked { seed, kernels, .. } => {
                Space::forked(base, seed.clone(), kernels.clone(), companions)
            }
            Attach {
                seed,
                images,
                filter,
                ..
            } => Space::attach(base, seed.clone(), images.clone(), filter.clone(), companions),
            Locator {
                seed,
                images,
                filter,
                ..
            } => Space::locator(base, seed.clone(), images.clone(), filter.clone(), companions),
            Clipped {
                seed,
                limit,
                offset,
                ..
            } => Space::clipped(base, seed.clone(), *limit, *offset, companions),
            _ => panic!("{} space does not carry companions", self.kind.as_ref()),
        }
    }

    /// The space itself, its base, the base of its base and so on.
    pub fn unfold(self: &Rc<Space>) -> Vec<Rc<Space>> {
        let mut ancestors = Vec::new();
        let mut ancestor = Some(self.clone());
        while let Some(space) = ancestor {
            ancestor = space.base.clone();
            ancestors.push(space);
        }
        ancestors
    }

    /// Do the spaces represent the same operation, possibly over
    /// different bases?
    pub fn resembles(&self, other: &Space) -> bool {
        kind_basis_eq(&self.kind, &other.kind)
    }

    /// Erases all non-axial operations from the ancestor chain; the
    /// canonical form used for unit attachment.  Idempotent.
    pub fn inflate(self: &Rc<Space>) -> Rc<Space> {
        if self.is_inflated {
            return self.clone();
        }
        let mut space: Option<Rc<Space>> = None;
        for ancestor in self.unfold().into_iter().rev() {
            if ancestor.is_axis() {
                space = Some(ancestor.clone_with_base(space));
            }
        }
        space.expect("every chain starts at the root")
    }

    /// Prunes non-axial operations of `self` that also occur in `other`:
    /// produces a superset space whose convergence with `other` is
    /// unchanged.
    pub fn prune(self: &Rc<Space>, other: &Rc<Space>) -> Rc<Space> {
        if self.is_inflated {
            return self.clone();
        }
        let mut mine = self.unfold();
        let mut theirs = other.unfold();
        let mut space: Option<Rc<Space>> = None;
        while !mine.is_empty() && !theirs.is_empty() {
            let my_ancestor = mine.last().unwrap().clone();
            let their_ancestor = theirs.last().unwrap().clone();
            if my_ancestor.resembles(&their_ancestor) {
                if !(my_ancestor.is_commutative() || my_ancestor == their_ancestor) {
                    return self.clone();
                }
                if my_ancestor.is_axis() {
                    space = Some(my_ancestor.clone_with_base(space));
                }
                mine.pop();
                theirs.pop();
            } else if !their_ancestor.is_axis() {
                theirs.pop();
            } else if !my_ancestor.is_axis() {
                if !my_ancestor.is_commutative() {
                    return self.clone();
                }
                space = Some(my_ancestor.clone_with_base(space));
                mine.pop();
            } else {
                // Both chains are axial and diverge; not comparable
                // beyond this point.
                break;
            }
        }
        while let Some(my_ancestor) = mine.pop() {
            if !my_ancestor.is_commutative() {
                return self.clone();
            }
            space = Some(my_ancestor.clone_with_base(space));
        }
        space.expect("every chain starts at the root")
    }

    /// Each row of `self` has at most one converging row in `other`.
    pub fn spans(self: &Rc<Space>, other: &Rc<Space>) -> bool {
        if self == other {
            return true;
        }
        let mut my_axes: Vec<Rc<Space>> =
            self.unfold().into_iter().filter(|s| s.is_axis()).collect();
        let mut their_axes: Vec<Rc<Space>> =
            other.unfold().into_iter().filter(|s| s.is_axis()).collect();
        while !my_axes.is_empty() && !their_axes.is_empty() {
            if my_axes.last().unwrap().resembles(their_axes.last().unwrap()) {
                my_axes.pop();
                their_axes.pop();
            } else {
                break;
            }
        }
        their_axes.iter().all(|axis| axis.is_contracting)
    }

    /// The convergence establishes a bijection between the spaces.
    pub fn conforms(self: &Rc<Space>, other: &Rc<Space>) -> bool {
        if self == other {
            return true;
        }
        let mut mine = self.unfold();
        let mut theirs = other.unfold();
        while !mine.is_empty() && !theirs.is_empty() {
            let my_ancestor = mine.last().unwrap().clone();
            let their_ancestor = theirs.last().unwrap().clone();
            if my_ancestor.resembles(&their_ancestor) {
                mine.pop();
                theirs.pop();
            } else if my_ancestor.is_contracting
                && my_ancestor.is_expanding
                && !my_ancestor.is_axis()
            {
                mine.pop();
            } else if their_ancestor.is_contracting
                && their_ancestor.is_expanding
                && !their_ancestor.is_axis()
            {
                theirs.pop();
            } else {
                break;
            }
        }
        mine.iter()
            .chain(theirs.iter())
            .all(|ancestor| ancestor.is_contracting && ancestor.is_expanding)
    }

    /// `self` spans `other` and every `other` row has a converging row.
    pub fn dominates(self: &Rc<Space>, other: &Rc<Space>) -> bool {
        if self == other {
            return true;
        }
        let mut mine = self.unfold();
        let mut theirs = other.unfold();
        while !mine.is_empty() && !theirs.is_empty() {
            let my_ancestor = mine.last().unwrap().clone();
            let their_ancestor = theirs.last().unwrap().clone();
            if my_ancestor.resembles(&their_ancestor) {
                mine.pop();
                theirs.pop();
            } else if their_ancestor.is_contracting && !their_ancestor.is_axis() {
                theirs.pop();
            } else {
                break;
            }
        }
        mine.iter().all(|ancestor| ancestor.is_expanding)
            && theirs.iter().all(|ancestor| ancestor.is_contracting)
    }

    /// Is `other` an ancestor of `self` along base links?
    pub fn concludes(self: &Rc<Space>, other: &Rc<Space>) -> bool {
        let mut space = Some(self.clone());
        while let Some(current) = space {
            if &current == other {
                return true;
            }
            space = current.base.clone();
        }
        false
    }

    fn basis_hash(&self) -> u64 {
        *self.hash.get_or_init(|| {
            let mut hasher = DefaultHasher::new();
            discriminant(&self.kind).hash(&mut hasher);
            kind_basis_hash(&self.kind, &mut hasher);
            if let Some(base) = &self.base {
                base.basis_hash().hash(&mut hasher);
            }
            hasher.finish()
        })
    }
}

impl PartialEq for Space {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.basis_hash() != other.basis_hash() {
            return false;
        }
        kind_basis_eq(&self.kind, &other.kind) && self.base == other.base
    }
}

impl Eq for Space {}

impl Hash for Space {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.basis_hash());
    }
}

// Structural equality of one space operation, bases aside.  Derived
// attributes (ground) and compilation hints (companions) are excluded.
fn kind_basis_eq(left: &SpaceKind, right: &SpaceKind) -> bool {
    use SpaceKind::*;
    match (left, right) {
        (Root, Root) | (Scalar, Scalar) | (Complement { .. }, Complement { .. }) => true,
        (DirectTable { table: l }, DirectTable { table: r }) => l == r,
        (FiberTable { join: l }, FiberTable { join: r }) => l == r,
        (
            Quotient {
                seed: ls,
                kernels: lk,
                ..
            },
            Quotient {
                seed: rs,
                kernels: rk,
                ..
            },
        ) => ls == rs && lk == rk,
        (Moniker { seed: ls, .. }, Moniker { seed: rs, .. }) => ls == rs,
        (
            Forked {
                seed: ls,
                kernels: lk,
                ..
            },
            Forked {
                seed: rs,
                kernels: rk,
                ..
            },
        ) => ls == rs && lk == rk,
        (
            Attach {
                seed: ls,
                images: li,
                filter: lf,
                ..
            },
            Attach {
                seed: rs,
                images: ri,
                filter: rf,
                ..
            },
        )
        | (
            Locator {
                seed: ls,
                images: li,
                filter: lf,
                ..
            },
            Locator {
                seed: rs,
                images: ri,
                filter: rf,
                ..
            },
        ) => ls == rs && li == ri && lf == rf,
        (
            Clipped {
                seed: ls,
                limit: ll,
                offset: lo,
                ..
            },
            Clipped {
                seed: rs,
                limit: rl,
                offset: ro,
                ..
            },
        ) => ls == rs && ll == rl && lo == ro,
        (Filtered { filter: l }, Filtered { filter: r }) => l == r,
        (
            Ordered {
                order: lo,
                limit: ll,
                offset: lf,
            },
            Ordered {
                order: ro,
                limit: rl,
                offset: rf,
            },
        ) => lo == ro && ll == rl && lf == rf,
        _ => false,
    }
}

fn kind_basis_hash(kind: &SpaceKind, hasher: &mut DefaultHasher) {
    use SpaceKind::*;
    match kind {
        Root | Scalar | Complement { .. } => {}
        DirectTable { table } => table.hash(hasher),
        FiberTable { join } => join.hash(hasher),
        Quotient { seed, kernels, .. } | Forked { seed, kernels, .. } => {
            seed.hash(hasher);
            kernels.hash(hasher);
        }
        Moniker { seed, .. } => seed.hash(hasher),
        Attach {
            seed,
            images,
            filter,
            ..
        }
        | Locator {
            seed,
            images,
            filter,
            ..
        } => {
            seed.hash(hasher);
            images.hash(hasher);
            filter.hash(hasher);
        }
        Clipped {
            seed,
            limit,
            offset,
            ..
        } => {
            seed.hash(hasher);
            limit.hash(hasher);
            offset.hash(hasher);
        }
        Filtered { filter } => filter.hash(hasher),
        Ordered {
            order,
            limit,
            offset,
        } => {
            order.hash(hasher);
            limit.hash(hasher);
            offset.hash(hasher);
        }
    }
}

/// A scalar-valued expression over spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Code {
    Literal {
        value: Value,
        domain: Domain,
    },
    Cast {
        base: Rc<Code>,
        domain: Domain,
    },
    Formula {
        signature: Signature,
        domain: Domain,
        arguments: Vec<Rc<Code>>,
    },
    /// A placeholder for a value imported from the enclosing frame of a
    /// correlated subquery.
    Correlation {
        code: Rc<Code>,
    },
    Unit(Unit),
}

impl Code {
    pub fn literal(value: Value, domain: Domain) -> Rc<Code> {
        Rc::new(Code::Literal { value, domain })
    }

    pub fn true_literal() -> Rc<Code> {
        Code::literal(Value::Boolean(true), Domain::Boolean)
    }

    pub fn false_literal() -> Rc<Code> {
        Code::literal(Value::Boolean(false), Domain::Boolean)
    }

    pub fn integer_literal(value: i64) -> Rc<Code> {
        Code::literal(Value::Integer(value), Domain::Integer)
    }

    pub fn formula(signature: Signature, domain: Domain, arguments: Vec<Rc<Code>>) -> Rc<Code> {
        Rc::new(Code::Formula {
            signature,
            domain,
            arguments,
        })
    }

    /// `!is_null(op)`
    pub fn is_not_null(op: Rc<Code>) -> Rc<Code> {
        Code::formula(
            Signature::IsNull {
                polarity: Polarity::Negative,
            },
            Domain::Boolean,
            vec![op],
        )
    }

    /// A conjunction; unwraps a singleton.
    pub fn conjoin(mut ops: Vec<Rc<Code>>) -> Rc<Code> {
        if ops.len() == 1 {
            ops.pop().unwrap()
        } else {
            Code::formula(Signature::And, Domain::Boolean, ops)
        }
    }

    /// A disjunction; unwraps a singleton.
    pub fn disjoin(mut ops: Vec<Rc<Code>>) -> Rc<Code> {
        if ops.len() == 1 {
            ops.pop().unwrap()
        } else {
            Code::formula(Signature::Or, Domain::Boolean, ops)
        }
    }

    pub fn domain(&self) -> &Domain {
        match self {
            Code::Literal { domain, .. } => domain,
            Code::Cast { domain, .. } => domain,
            Code::Formula { domain, .. } => domain,
            Code::Correlation { code } => code.domain(),
            Code::Unit(unit) => unit.domain(),
        }
    }

    /// The unit expressions the code is composed of.
    pub fn units(&self) -> Vec<Unit> {
        let mut units = Vec::new();
        self.collect_units(&mut units);
        units
    }

    fn collect_units(&self, units: &mut Vec<Unit>) {
        match self {
            Code::Literal { .. } => {}
            Code::Cast { base, .. } => base.collect_units(units),
            Code::Formula { arguments, .. } => {
                for argument in arguments {
                    argument.collect_units(units);
                }
            }
            Code::Correlation { .. } => {}
            Code::Unit(unit) => units.push(unit.clone()),
        }
    }

    /// Injection priority; expressions with companions go first.
    pub fn priority(&self) -> usize {
        self.units()
            .iter()
            .map(|unit| match unit {
                Unit::Scalar { companions, .. } => 1 + companions.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn as_unit(&self) -> Option<&Unit> {
        match self {
            Code::Unit(unit) => Some(unit),
            _ => None,
        }
    }
}

/// An elementary space-indexed code.
///
/// For a unit on space `A` and any space `B` that spans `A`, the unit
/// lifts to `B`: each `B` row sees the value of its unique converging
/// `A` row, or `NULL` when there is none.
#[derive(Debug, Clone)]
pub enum Unit {
    /// A column of the prominent table of the space; exported natively
    /// by any term routing the space.
    Column {
        column: ColumnRef,
        space: Rc<Space>,
        domain: Domain,
    },
    /// An expression evaluated once per row of the space.
    Scalar {
        code: Rc<Code>,
        space: Rc<Space>,
        companions: Vec<Rc<Code>>,
    },
    /// An expression over the subset of the plural space converging to
    /// each row of the unit space.
    Aggregate {
        code: Rc<Code>,
        plural_space: Rc<Space>,
        space: Rc<Space>,
        companions: Vec<Rc<Code>>,
    },
    /// An aggregate realized as a correlated subquery.
    Correlated {
        code: Rc<Code>,
        plural_space: Rc<Space>,
        space: Rc<Space>,
    },
    /// A projection column of a quotient.
    Kernel { code: Rc<Code>, space: Rc<Space> },
    /// An exported unit of a covering space.
    Covering { code: Rc<Code>, space: Rc<Space> },
}

impl Unit {
    pub fn space(&self) -> &Rc<Space> {
        match self {
            Unit::Column { space, .. }
            | Unit::Scalar { space, .. }
            | Unit::Aggregate { space, .. }
            | Unit::Correlated { space, .. }
            | Unit::Kernel { space, .. }
            | Unit::Covering { space, .. } => space,
        }
    }

    pub fn domain(&self) -> &Domain {
        match self {
            Unit::Column { domain, .. } => domain,
            Unit::Scalar { code, .. }
            | Unit::Aggregate { code, .. }
            | Unit::Correlated { code, .. }
            | Unit::Kernel { code, .. }
            | Unit::Covering { code, .. } => code.domain(),
        }
    }

    pub fn code(&self) -> Option<&Rc<Code>> {
        match self {
            Unit::Column { .. } => None,
            Unit::Scalar { code, .. }
            | Unit::Aggregate { code, .. }
            | Unit::Correlated { code, .. }
            | Unit::Kernel { code, .. }
            | Unit::Covering { code, .. } => Some(code),
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, Unit::Column { .. })
    }

    pub fn is_compound(&self) -> bool {
        !self.is_primitive()
    }

    /// Is the unit well-defined on the given space?
    pub fn singular(&self, space: &Rc<Space>) -> bool {
        space.spans(self.space())
    }

    pub fn with_space(&self, space: Rc<Space>) -> Unit {
        let mut unit = self.clone();
        match &mut unit {
            Unit::Column { space: s, .. }
            | Unit::Scalar { space: s, .. }
            | Unit::Aggregate { space: s, .. }
            | Unit::Correlated { space: s, .. }
            | Unit::Kernel { space: s, .. }
            | Unit::Covering { space: s, .. } => *s = space,
        }
        unit
    }

    pub fn into_code(self) -> Rc<Code> {
        Rc::new(Code::Unit(self))
    }
}

// Companions are excluded from the basis.
impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        use Unit::*;
        match (self, other) {
            (
                Column {
                    column: lc,
                    space: ls,
                    ..
                },
                Column {
                    column: rc,
                    space: rs,
                    ..
                },
            ) => lc == rc && ls == rs,
            (
                Scalar {
                    code: lc, space: ls, ..
                },
                Scalar {
                    code: rc, space: rs, ..
                },
            ) => lc == rc && ls == rs,
            (
                Aggregate {
                    code: lc,
                    plural_space: lp,
                    space: ls,
                    ..
                },
                Aggregate {
                    code: rc,
                    plural_space: rp,
                    space: rs,
                    ..
                },
            ) => lc == rc && lp == rp && ls == rs,
            (
                Correlated {
                    code: lc,
                    plural_space: lp,
                    space: ls,
                },
                Correlated {
                    code: rc,
                    plural_space: rp,
                    space: rs,
                },
            ) => lc == rc && lp == rp && ls == rs,
            (
                Kernel {
                    code: lc,
                    space: ls,
                },
                Kernel {
                    code: rc,
                    space: rs,
                },
            ) => lc == rc && ls == rs,
            (
                Covering {
                    code: lc,
                    space: ls,
                },
                Covering {
                    code: rc,
                    space: rs,
                },
            ) => lc == rc && ls == rs,
            _ => false,
        }
    }
}

impl Eq for Unit {}

impl Hash for Unit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        discriminant(self).hash(state);
        match self {
            Unit::Column { column, space, .. } => {
                column.hash(state);
                space.hash(state);
            }
            Unit::Scalar { code, space, .. } => {
                code.hash(state);
                space.hash(state);
            }
            Unit::Aggregate {
                code,
                plural_space,
                space,
                ..
            }
            | Unit::Correlated {
                code,
                plural_space,
                space,
            } => {
                code.hash(state);
                plural_space.hash(state);
                space.hash(state);
            }
            Unit::Kernel { code, space } | Unit::Covering { code, space } => {
                code.hash(state);
                space.hash(state);
            }
        }
    }
}

/// The root of a compiled query unit: an output space with the codes to
/// evaluate over it and nested segments to attach.
#[derive(Debug, Clone)]
pub struct SegmentExpr {
    pub root: Rc<Space>,
    pub space: Rc<Space>,
    pub codes: Vec<Rc<Code>>,
    pub dependents: Vec<Rc<SegmentExpr>>,
    /// The flow the segment was encoded from; used by pack to rebuild
    /// the output shape.
    pub flow: Rc<Flow>,
}

impl PartialEq for SegmentExpr {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
            && self.space == other.space
            && self.codes == other.codes
            && self.dependents == other.dependents
    }
}

impl Eq for SegmentExpr {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::Catalog;

    fn school_pair() -> (Catalog, TableRef, TableRef) {
        let mut catalog = Catalog::new();
        let school = catalog.add_table("school");
        catalog.add_column(school, "code", Domain::text(), false);
        catalog.add_primary_key(school, &["code"]);
        let department = catalog.add_table("department");
        catalog.add_column(department, "code", Domain::text(), false);
        catalog.add_column(department, "school_code", Domain::text(), false);
        catalog.add_primary_key(department, &["code"]);
        catalog.add_foreign_key(department, &["school_code"], school, &["code"]);
        (catalog, school, department)
    }

    fn table_space(table: TableRef) -> Rc<Space> {
        Space::direct_table(Space::scalar(Space::root()), table)
    }

    #[test]
    fn equality_is_structural() {
        let (catalog, school, _) = school_pair();
        let a = table_space(school);
        let b = table_space(school);
        assert_eq!(a, b);
        let filtered = Space::filtered(a.clone(), Code::true_literal());
        assert_ne!(a, filtered);
    }

    #[test]
    fn inflation_erases_non_axial_operations() {
        let (catalog, school, _) = school_pair();
        let table = table_space(school);
        let filtered = Space::filtered(table.clone(), Code::true_literal());
        assert!(!filtered.is_inflated);
        assert_eq!(filtered.inflate(), table);
        // Idempotent.
        assert_eq!(filtered.inflate().inflate(), table);
    }

    #[test]
    fn a_space_spans_its_contractions_but_not_expansions() {
        let (catalog, school, department) = school_pair();
        let schools = table_space(school);
        let filtered = Space::filtered(schools.clone(), Code::true_literal());
        assert!(schools.spans(&filtered));
        assert!(filtered.spans(&schools));

        let join = catalog.reverse_joins(school).remove(0);
        let departments = Space::fiber_table(schools.clone(), join);
        assert!(departments.spans(&schools));
        assert!(!schools.spans(&departments));
    }

    #[test]
    fn dominance_and_conformance() {
        let (catalog, school, _) = school_pair();
        let schools = table_space(school);
        let filtered = Space::filtered(schools.clone(), Code::true_literal());
        // Filtering contracts: the base dominates the filtered space.
        assert!(schools.dominates(&filtered));
        assert!(!filtered.dominates(&schools));
        assert!(!filtered.conforms(&schools));
        // An ordered space without a slice conforms its base.
        let ordered = Space::ordered(schools.clone(), Vec::new(), None, None);
        assert!(ordered.conforms(&schools));
        // A sliced one does not.
        let sliced = Space::ordered(schools.clone(), Vec::new(), Some(3), None);
        assert!(!sliced.conforms(&schools));
    }

    #[test]
    fn prune_drops_shared_filters() {
        let (catalog, school, _) = school_pair();
        let schools = table_space(school);
        let filtered = Space::filtered(schools.clone(), Code::true_literal());
        assert_eq!(filtered.prune(&filtered), schools);
        // Pruning against an unrelated space keeps the filter.
        assert_eq!(filtered.prune(&schools), filtered);
    }

    #[test]
    fn quotient_ground_stops_at_the_spanned_ancestor() {
        let (catalog, school, department) = school_pair();
        let schools = table_space(school);
        let join = catalog.reverse_joins(school).remove(0);
        let departments = Space::fiber_table(schools.clone(), join);
        let quotient = Space::quotient(schools.clone(), departments.clone(), vec![]);
        assert_eq!(quotient.ground().unwrap(), &departments);
        assert!(quotient.is_contracting);
    }

    #[test]
    fn companions_do_not_affect_equality() {
        let (catalog, school, department) = school_pair();
        let schools = table_space(school);
        let join = catalog.reverse_joins(school).remove(0);
        let departments = Space::fiber_table(schools.clone(), join);
        let plain = Space::quotient(schools.clone(), departments.clone(), vec![]);
        let hinted = plain.with_companions(vec![Code::true_literal()]);
        assert_eq!(plain, hinted);
    }
}
