//! Final shaping of the output.
//!
//! Pack walks the original flow tree (not the rewritten one) in
//! lockstep with the assembled segment frames, consuming their code and
//! dependent pipes depth-first and wrapping them in record
//! constructors matching the user-visible output schema.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::domain::{Data, Domain, Profile};
use crate::error::{Error, Result};
use crate::tr::flow::{Flow, FlowKind};
use crate::tr::frame::SegmentFrame;
use crate::tr::pipe::Pipe;

struct PackingState<'a> {
    segment: &'a SegmentFrame,
    code_pipes: VecDeque<Pipe>,
    dependent_pipes: VecDeque<Pipe>,
    is_top: bool,
}

impl<'a> PackingState<'a> {
    fn new(segment: &'a SegmentFrame, is_top: bool) -> PackingState<'a> {
        PackingState {
            segment,
            code_pipes: segment.code_pipes.iter().cloned().collect(),
            dependent_pipes: segment.dependent_pipes.iter().cloned().collect(),
            is_top,
        }
    }

    fn pull_code(&mut self) -> Result<Pipe> {
        self.code_pipes
            .pop_front()
            .ok_or_else(|| Error::simple("expected an output column").into())
    }

    fn pull_dependent(&mut self) -> Result<Pipe> {
        self.dependent_pipes
            .pop_front()
            .ok_or_else(|| Error::simple("expected a dependent segment").into())
    }

    fn pack(&mut self, flow: &Rc<Flow>) -> Result<Pipe> {
        if !matches!(flow.kind, FlowKind::Collect { .. }) {
            self.is_top = false;
        }
        match &flow.kind {
            FlowKind::Collect { seed, .. } => {
                if self.is_top {
                    self.is_top = false;
                    Ok(self.pack(seed)?.iterate())
                } else {
                    // A nested segment: pick the merged child rows and
                    // shape them against the dependent frame.
                    let dependent_pipe = self.pull_dependent()?;
                    let Pipe::Extract(index) = &dependent_pipe else {
                        return Err(Error::simple("expected a dependent extractor").into());
                    };
                    let position = if *index < 0 {
                        (self.segment.dependents.len() as isize + index) as usize
                    } else {
                        *index as usize
                    };
                    let dependent = self
                        .segment
                        .dependents
                        .get(position)
                        .ok_or_else(|| -> anyhow::Error {
                            Error::simple("dependent index out of range").into()
                        })?;
                    let mut substate = PackingState::new(dependent, false);
                    let pipe = substate.pack(seed)?.iterate();
                    Ok(dependent_pipe.compose(pipe))
                }
            }
            FlowKind::Selection { elements, .. } => {
                let test = self.pull_code()?;
                let mut field_pipes = Vec::new();
                for element in elements {
                    field_pipes.push(self.pack(element)?);
                }
                let pipe = Pipe::Record(field_pipes);
                Ok(annihilate(test, pipe))
            }
            FlowKind::Identity { elements, .. } => {
                let test = self.pull_code()?;
                let mut field_pipes = Vec::new();
                for element in elements {
                    field_pipes.push(self.pack(element)?);
                }
                let pipe = Pipe::Record(field_pipes);
                Ok(annihilate(test, pipe))
            }
            _ => self.pull_code(),
        }
    }
}

fn annihilate(test: Pipe, pipe: Pipe) -> Pipe {
    if matches!(
        &test,
        Pipe::Value(Data::Value(crate::domain::Value::Boolean(true)))
    ) {
        return pipe;
    }
    Pipe::Annihilate {
        test: Box::new(test),
        value: Box::new(pipe),
    }
}

/// Builds the shaping pipe for the whole output.
///
/// A top-level non-collect flow wraps into `Iterate ∘ Single`, turning
/// the single row of the implicit segment back into one record.
pub fn pack(flow: &Rc<Flow>, segment: &SegmentFrame) -> Result<Pipe> {
    log::debug!("packing the output shape");
    let mut state = PackingState::new(segment, true);
    let mut pipe = state.pack(flow)?;
    if !matches!(flow.kind, FlowKind::Collect { .. }) {
        pipe = pipe.iterate().compose(Pipe::Single);
    }
    Ok(pipe)
}

/// The output profile of a flow: the meta tree shipped with the plan.
pub fn profile(flow: &Rc<Flow>) -> Profile {
    let domain = match &flow.kind {
        FlowKind::Collect { seed, .. } => Domain::List(Box::new(profile(seed).domain)),
        _ => flow.domain.clone(),
    };
    Profile {
        domain,
        tag: None,
        header: None,
        syntax: flow.syntax.clone(),
        path: Vec::new(),
    }
}
