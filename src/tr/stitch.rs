//! Ordering, native-unit spread and joint generation per space.
//!
//! Four polymorphic adapters over the space classes:
//!
//! - `arrange` produces the ordering of a space: explicit (strong) sort
//!   expressions layered over implicit (weak) ones — table keys, quotient
//!   kernels, then the parent's weak order.
//! - `spread` produces the native units every term representing the
//!   space must export.
//! - `sew` produces joints for parallel-joining two terms on the same
//!   space.
//! - `tie` produces joints for serial-joining a space to its base.
//!
//! Units inside joints always belong to inflated spaces.

use std::collections::HashSet;
use std::rc::Rc;

use crate::catalog::{Catalog, ColumnRef};
use crate::error::{Error, Result};
use crate::syntax::Direction;
use crate::tr::space::{Code, Space, SpaceKind, Unit};
use crate::tr::term::Joint;

fn column_unit(catalog: &Catalog, column: ColumnRef, space: Rc<Space>) -> Unit {
    Unit::Column {
        column,
        space,
        domain: catalog.column(column).domain.clone(),
    }
}

/// Rewrites a column reference across direct, one-to-one fiber joins:
/// while the column is the target of such a join, it is replaced by the
/// origin column on the base space.  Shared by weak ordering and column
/// unmasking.
pub fn undirect_column(
    mut space: Rc<Space>,
    mut column: ColumnRef,
) -> (Rc<Space>, ColumnRef) {
    loop {
        let redirected = match &space.kind {
            SpaceKind::FiberTable { join }
                if join.is_direct && space.is_expanding && space.is_contracting =>
            {
                join.origin_columns
                    .iter()
                    .zip(join.target_columns.iter())
                    .find(|(_, target_column)| column == **target_column)
                    .map(|(origin_column, _)| *origin_column)
            }
            _ => None,
        };
        match redirected {
            Some(origin_column) => {
                column = origin_column;
                space = {
                    let base = space.base.clone();
                    base.expect("a fiber space has a base")
                };
            }
            None => break,
        }
    }
    (space, column)
}

/// The ordering of the space as `(code, direction)` pairs; duplicates
/// are discarded preserving the first occurrence.
pub fn arrange(
    catalog: &Catalog,
    space: &Rc<Space>,
    with_strong: bool,
    with_weak: bool,
) -> Vec<(Rc<Code>, Direction)> {
    let mut order = Vec::new();
    let mut duplicates = HashSet::new();
    for (code, direction) in arrange_raw(catalog, space, with_strong, with_weak) {
        if duplicates.contains(&code) {
            continue;
        }
        duplicates.insert(code.clone());
        order.push((code, direction));
    }
    order
}

fn arrange_raw(
    catalog: &Catalog,
    space: &Rc<Space>,
    with_strong: bool,
    with_weak: bool,
) -> Vec<(Rc<Code>, Direction)> {
    let Some(base) = &space.base else {
        return Vec::new();
    };
    match &space.kind {
        SpaceKind::DirectTable { .. } | SpaceKind::FiberTable { .. } => {
            let mut order = arrange_raw(catalog, base, with_strong, with_weak);
            // Weak table ordering kicks in only when the axis grows the
            // cardinality of its base.
            if with_weak && !space.is_contracting {
                let table = space.family.table().expect("a table space");
                let columns = catalog
                    .connecting_columns(table)
                    .unwrap_or_else(|| {
                        (0..catalog.table(table).columns.len())
                            .map(|index| ColumnRef { table, index })
                            .collect()
                    });
                let inflated = space.inflate();
                for column in columns {
                    let (column_space, column) =
                        undirect_column(inflated.clone(), column);
                    order.push((
                        column_unit(catalog, column, column_space).into_code(),
                        Direction::Ascending,
                    ));
                }
            }
            order
        }
        SpaceKind::Quotient { kernels, .. } => {
            let mut order = arrange_raw(catalog, base, with_strong, with_weak);
            if with_weak {
                let inflated = space.inflate();
                for code in kernels {
                    order.push((
                        Unit::Kernel {
                            code: code.clone(),
                            space: inflated.clone(),
                        }
                        .into_code(),
                        Direction::Ascending,
                    ));
                }
            }
            order
        }
        SpaceKind::Complement { seed, ground, .. }
        | SpaceKind::Moniker { seed, ground, .. }
        | SpaceKind::Forked { seed, ground, .. }
        | SpaceKind::Attach { seed, ground, .. }
        | SpaceKind::Locator { seed, ground, .. }
        | SpaceKind::Clipped { seed, ground, .. } => {
            let mut order = arrange_raw(catalog, base, with_strong, with_weak);
            if with_weak {
                let inflated = space.inflate();
                // Expressions singular against the parent space cannot
                // affect the ordering and are dropped.
                let singular_base = ground.base.clone();
                for (code, direction) in arrange(catalog, seed, true, true) {
                    let kept = match &singular_base {
                        None => true,
                        Some(singular_base) => code
                            .units()
                            .iter()
                            .any(|unit| !singular_base.spans(unit.space())),
                    };
                    if kept {
                        order.push((
                            Unit::Covering {
                                code,
                                space: inflated.clone(),
                            }
                            .into_code(),
                            direction,
                        ));
                    }
                }
            }
            order
        }
        SpaceKind::Ordered { order, .. } => {
            let mut result = Vec::new();
            if with_strong {
                result.extend(arrange_raw(catalog, base, true, false));
                result.extend(order.iter().cloned());
            }
            if with_weak {
                result.extend(arrange_raw(catalog, base, false, true));
            }
            result
        }
        // Scalar and non-axial spaces inherit the parent ordering.
        _ => arrange_raw(catalog, base, with_strong, with_weak),
    }
}

/// The native units of the space: the units exported by any term
/// representing it.
pub fn spread(catalog: &Catalog, space: &Rc<Space>) -> Result<Vec<Unit>> {
    match &space.kind {
        SpaceKind::DirectTable { .. } | SpaceKind::FiberTable { .. } => {
            let table = space.family.table().expect("a table space");
            Ok((0..catalog.table(table).columns.len())
                .map(|index| {
                    column_unit(catalog, ColumnRef { table, index }, space.clone())
                })
                .collect())
        }
        SpaceKind::Quotient {
            ground, kernels, ..
        } => {
            let mut units = Vec::new();
            // The ground side of the tie must be exported by any term
            // representing the quotient.
            for joint in tie(catalog, ground)? {
                units.push(Unit::Kernel {
                    code: joint.rop,
                    space: space.clone(),
                });
            }
            for code in kernels {
                units.push(Unit::Kernel {
                    code: code.clone(),
                    space: space.clone(),
                });
            }
            Ok(units)
        }
        SpaceKind::Complement { seed, .. }
        | SpaceKind::Moniker { seed, .. }
        | SpaceKind::Forked { seed, .. }
        | SpaceKind::Attach { seed, .. }
        | SpaceKind::Locator { seed, .. }
        | SpaceKind::Clipped { seed, .. } => {
            let inflated_seed = seed.inflate();
            Ok(spread(catalog, &inflated_seed)?
                .into_iter()
                .map(|unit| unit.with_space(space.clone()))
                .collect())
        }
        SpaceKind::Root | SpaceKind::Scalar => Ok(Vec::new()),
        // Non-axial spaces reparent the native units of their base.
        _ => {
            let base = space.base.as_ref().expect("a non-axial space has a base");
            Ok(spread(catalog, base)?
                .into_iter()
                .map(|unit| unit.with_space(space.clone()))
                .collect())
        }
    }
}

/// Joints connecting two parallel terms representing the same space.
pub fn sew(catalog: &Catalog, space: &Rc<Space>) -> Result<Vec<Joint>> {
    if !space.is_axis() {
        let base = space.base.as_ref().expect("a non-axial space has a base");
        return sew(catalog, base);
    }
    match &space.kind {
        SpaceKind::Root | SpaceKind::Scalar => Ok(Vec::new()),
        SpaceKind::DirectTable { .. } | SpaceKind::FiberTable { .. } => {
            let table = space.family.table().expect("a table space");
            let Some(columns) = catalog.connecting_columns(table) else {
                return Err(Error::simple("unable to connect a table lacking a primary key")
                    .into());
            };
            let inflated = space.inflate();
            Ok(columns
                .into_iter()
                .map(|column| {
                    let unit = column_unit(catalog, column, inflated.clone()).into_code();
                    Joint::new(unit.clone(), unit)
                })
                .collect())
        }
        SpaceKind::Quotient {
            ground, kernels, ..
        } => {
            let inflated = space.inflate();
            let mut joints = Vec::new();
            for joint in tie(catalog, ground)? {
                let op = Unit::Kernel {
                    code: joint.rop,
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(op.clone(), op));
            }
            for code in kernels {
                let unit = Unit::Kernel {
                    code: code.clone(),
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(unit.clone(), unit));
            }
            Ok(joints)
        }
        SpaceKind::Complement { seed, ground, .. }
        | SpaceKind::Moniker { seed, ground, .. }
        | SpaceKind::Forked { seed, ground, .. }
        | SpaceKind::Attach { seed, ground, .. }
        | SpaceKind::Locator { seed, ground, .. }
        | SpaceKind::Clipped { seed, ground, .. } => {
            // Sew all axial spaces from the seed down to the ground.
            let inflated = space.inflate();
            let seed = seed.inflate();
            let baseline = ground.inflate();
            let mut axes = Vec::new();
            let mut axis = Some(seed);
            while let Some(current) = axis {
                if !current.concludes(&baseline) {
                    break;
                }
                axes.push(current.clone());
                axis = current.base.clone();
            }
            axes.reverse();
            let mut joints = Vec::new();
            for axis in axes {
                // Contracting axes cannot multiply rows and are skipped,
                // except for the baseline itself.
                if !axis.is_contracting || axis == baseline {
                    for joint in sew(catalog, &axis)? {
                        let op = Unit::Covering {
                            code: joint.lop,
                            space: inflated.clone(),
                        }
                        .into_code();
                        joints.push(Joint::new(op.clone(), op));
                    }
                }
            }
            Ok(joints)
        }
        _ => unreachable!("axial spaces are handled above"),
    }
}

/// Joints connecting the space to its base.
pub fn tie(catalog: &Catalog, space: &Rc<Space>) -> Result<Vec<Joint>> {
    if !space.is_axis() {
        let base = space.base.as_ref().expect("a non-axial space has a base");
        return tie(catalog, base);
    }
    match &space.kind {
        SpaceKind::Root | SpaceKind::Scalar | SpaceKind::DirectTable { .. } => Ok(Vec::new()),
        SpaceKind::FiberTable { .. } => {
            let inflated = space.inflate();
            let SpaceKind::FiberTable { join } = &inflated.kind else {
                unreachable!();
            };
            let base = inflated.base.clone().expect("a fiber space has a base");
            Ok(join
                .origin_columns
                .iter()
                .zip(join.target_columns.iter())
                .map(|(lcolumn, rcolumn)| {
                    Joint::new(
                        column_unit(catalog, *lcolumn, base.clone()).into_code(),
                        column_unit(catalog, *rcolumn, inflated.clone()).into_code(),
                    )
                })
                .collect())
        }
        SpaceKind::Quotient { ground, .. } => {
            let inflated = space.inflate();
            Ok(tie(catalog, ground)?
                .into_iter()
                .map(|joint| {
                    let rop = Unit::Kernel {
                        code: joint.rop.clone(),
                        space: inflated.clone(),
                    }
                    .into_code();
                    joint.with_rop(rop)
                })
                .collect())
        }
        SpaceKind::Complement {
            ground, kernels, ..
        } => {
            let inflated = space.inflate();
            let quotient = inflated.base.clone().expect("a complement has a base");
            let mut joints = Vec::new();
            for joint in tie(catalog, ground)? {
                // The ground base expression, once as embedded in the
                // quotient, once as embedded in the complement.
                let op = joint.rop;
                let lop = Unit::Kernel {
                    code: op.clone(),
                    space: quotient.clone(),
                }
                .into_code();
                let rop = Unit::Covering {
                    code: op,
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(lop, rop));
            }
            for code in kernels {
                let lop = Unit::Kernel {
                    code: code.clone(),
                    space: quotient.clone(),
                }
                .into_code();
                let rop = Unit::Covering {
                    code: code.clone(),
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(lop, rop));
            }
            Ok(joints)
        }
        SpaceKind::Moniker { ground, .. } => {
            let inflated = space.inflate();
            // A singular seed uses parallel joints of the ground; a
            // plural one uses the serial joints.
            let joints = if inflated.is_contracting {
                sew(catalog, ground)?
            } else {
                tie(catalog, ground)?
            };
            Ok(joints
                .into_iter()
                .map(|joint| {
                    let rop = Unit::Covering {
                        code: joint.rop.clone(),
                        space: inflated.clone(),
                    }
                    .into_code();
                    joint.with_rop(rop)
                })
                .collect())
        }
        SpaceKind::Clipped { ground, .. } => {
            let inflated = space.inflate();
            Ok(tie(catalog, ground)?
                .into_iter()
                .map(|joint| {
                    let rop = Unit::Covering {
                        code: joint.rop.clone(),
                        space: inflated.clone(),
                    }
                    .into_code();
                    joint.with_rop(rop)
                })
                .collect())
        }
        SpaceKind::Forked { seed, kernels, .. } => {
            let inflated = space.inflate();
            let mut joints = Vec::new();
            // Attach the seed ground to its parent; both sides come from
            // the seed.
            for joint in tie(catalog, seed)? {
                let lop = joint.rop;
                let rop = Unit::Covering {
                    code: lop.clone(),
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(lop, rop));
            }
            // Attach the seed to itself by the kernel expressions.
            for code in kernels {
                let rop = Unit::Covering {
                    code: code.clone(),
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(code.clone(), rop));
            }
            Ok(joints)
        }
        SpaceKind::Attach {
            ground, images, ..
        }
        | SpaceKind::Locator {
            ground, images, ..
        } => {
            let inflated = space.inflate();
            let (inflated_images, _) = match &inflated.kind {
                SpaceKind::Attach { images, filter, .. }
                | SpaceKind::Locator { images, filter, .. } => (images.clone(), filter.clone()),
                _ => (images.clone(), None),
            };
            let mut joints = Vec::new();
            for joint in tie(catalog, ground)? {
                let rop = Unit::Covering {
                    code: joint.rop.clone(),
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(joint.with_rop(rop));
            }
            // The fiber conditions attach the seed to the base space.
            for (lop, rop) in inflated_images {
                let rop = Unit::Covering {
                    code: rop,
                    space: inflated.clone(),
                }
                .into_code();
                joints.push(Joint::new(lop, rop));
            }
            Ok(joints)
        }
        _ => unreachable!("axial spaces are handled above"),
    }
}
