//! Binding → Flow.
//!
//! A one-to-one structural walk: each binding class maps to its flow
//! class.  Sort directions are extracted at sort and clip nodes;
//! decorations disappear; optional attach conditions propagate `None`
//! through.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{guard, Result};
use crate::syntax::Direction;
use crate::tr::binding::{Binding, BindingKind};
use crate::tr::flow::{Flow, FlowKind};

struct RoutingState {
    cache: HashMap<*const Binding, Rc<Flow>>,
}

impl RoutingState {
    fn new() -> RoutingState {
        RoutingState {
            cache: HashMap::new(),
        }
    }

    fn route(&mut self, binding: &Rc<Binding>) -> Result<Rc<Flow>> {
        if let Some(flow) = self.cache.get(&Rc::as_ptr(binding)) {
            return Ok(flow.clone());
        }
        let flow = guard(binding.span, || self.route_kind(binding))?;
        self.cache.insert(Rc::as_ptr(binding), flow.clone());
        Ok(flow)
    }

    /// The sort direction carried by decorations around the binding.
    fn direct(binding: &Rc<Binding>) -> Direction {
        match &binding.kind {
            BindingKind::Decorate { direction, .. } => *direction,
            _ => Direction::Ascending,
        }
    }

    fn route_kind(&mut self, binding: &Rc<Binding>) -> Result<Rc<Flow>> {
        let kind = match &binding.kind {
            BindingKind::Root => FlowKind::Root,
            BindingKind::Home { base } => FlowKind::Home {
                base: self.route(base)?,
            },
            BindingKind::Table { base, table } => FlowKind::Table {
                base: self.route(base)?,
                table: *table,
            },
            BindingKind::Chain { base, joins } => FlowKind::Chain {
                base: self.route(base)?,
                joins: joins.clone(),
            },
            BindingKind::Column { base, column, link } => FlowKind::Column {
                base: self.route(base)?,
                column: *column,
                link: link.as_ref().map(|link| self.route(link)).transpose()?,
            },
            BindingKind::Sieve { base, filter } => FlowKind::Sieve {
                base: self.route(base)?,
                filter: self.route(filter)?,
            },
            BindingKind::Sort {
                base,
                order,
                limit,
                offset,
            } => {
                let base = self.route(base)?;
                let mut routed = Vec::new();
                for item in order {
                    let direction = Self::direct(item);
                    routed.push((self.route(item)?, direction));
                }
                FlowKind::Sort {
                    base,
                    order: routed,
                    limit: *limit,
                    offset: *offset,
                }
            }
            BindingKind::Quotient {
                base,
                seed,
                kernels,
            } => FlowKind::Quotient {
                base: self.route(base)?,
                seed: self.route(seed)?,
                kernels: kernels
                    .iter()
                    .map(|kernel| self.route(kernel))
                    .collect::<Result<_>>()?,
            },
            BindingKind::Kernel {
                base,
                quotient,
                index,
            } => FlowKind::Kernel {
                base: self.route(base)?,
                quotient: self.route(quotient)?,
                index: *index,
            },
            BindingKind::Complement { base, quotient } => FlowKind::Complement {
                base: self.route(base)?,
                quotient: self.route(quotient)?,
            },
            BindingKind::Cover { base, seed } => FlowKind::Cover {
                base: self.route(base)?,
                seed: self.route(seed)?,
            },
            BindingKind::Fork { base, kernels } => FlowKind::Fork {
                base: self.route(base)?,
                kernels: kernels
                    .iter()
                    .map(|kernel| self.route(kernel))
                    .collect::<Result<_>>()?,
            },
            BindingKind::Attach {
                base,
                seed,
                images,
                condition,
            } => FlowKind::Attach {
                base: self.route(base)?,
                seed: self.route(seed)?,
                images: self.route_images(images)?,
                condition: condition
                    .as_ref()
                    .map(|condition| self.route(condition))
                    .transpose()?,
            },
            BindingKind::Locate {
                base,
                seed,
                images,
                condition,
            } => FlowKind::Locate {
                base: self.route(base)?,
                seed: self.route(seed)?,
                images: self.route_images(images)?,
                condition: condition
                    .as_ref()
                    .map(|condition| self.route(condition))
                    .transpose()?,
            },
            BindingKind::Clip {
                base,
                seed,
                order,
                limit,
                offset,
            } => {
                let base = self.route(base)?;
                let seed = self.route(seed)?;
                let mut routed = Vec::new();
                for item in order {
                    let direction = Self::direct(item);
                    routed.push((self.route(item)?, direction));
                }
                FlowKind::Clip {
                    base,
                    seed,
                    order: routed,
                    limit: *limit,
                    offset: *offset,
                }
            }
            BindingKind::Selection { base, elements } => FlowKind::Selection {
                base: self.route(base)?,
                elements: elements
                    .iter()
                    .map(|element| self.route(element))
                    .collect::<Result<_>>()?,
            },
            BindingKind::Identity { base, elements } => FlowKind::Identity {
                base: self.route(base)?,
                elements: elements
                    .iter()
                    .map(|element| self.route(element))
                    .collect::<Result<_>>()?,
            },
            BindingKind::Literal { base, value } => FlowKind::Literal {
                base: self.route(base)?,
                value: value.clone(),
            },
            BindingKind::Cast { base } => FlowKind::Cast {
                base: self.route(base)?,
            },
            BindingKind::Formula {
                base,
                signature,
                arguments,
            } => FlowKind::Formula {
                base: self.route(base)?,
                signature: signature.clone(),
                arguments: arguments
                    .iter()
                    .map(|argument| self.route(argument))
                    .collect::<Result<_>>()?,
            },
            BindingKind::Collect { base, seed } => FlowKind::Collect {
                base: self.route(base)?,
                seed: self.route(seed)?,
            },
            BindingKind::Rescoping { base, scope } => FlowKind::Rescoping {
                base: self.route(base)?,
                scope: self.route(scope)?,
            },
            // Decorations are transparent.
            BindingKind::Decorate { base, .. } => return self.route(base),
        };
        Ok(Rc::new(Flow {
            kind,
            domain: binding.domain.clone(),
            span: binding.span,
            syntax: binding.syntax.clone(),
        }))
    }

    fn route_images(
        &mut self,
        images: &[(Rc<Binding>, Rc<Binding>)],
    ) -> Result<Vec<(Rc<Flow>, Rc<Flow>)>> {
        images
            .iter()
            .map(|(lop, rop)| Ok((self.route(lop)?, self.route(rop)?)))
            .collect()
    }
}

/// Translates a binding tree into a flow tree.
pub fn route(binding: &Rc<Binding>) -> Result<Rc<Flow>> {
    log::debug!("routing {}", binding.syntax.as_deref().unwrap_or("<expression>"));
    RoutingState::new().route(binding)
}
