//! Aggregate promises: All/Merge joins, Race, First, and Sequence.
//!
//! Every input is wired to its combinator through a pooled pass-through
//! edge. The edge fires exactly once when its input settles, feeds the
//! result into the combinator at a fixed index, releases the input edge's
//! retain on the combinator, and returns to the pool. A combinator therefore
//! stays alive until every input has settled, even when its own outcome was
//! decided earlier.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::arena::Key;
use crate::engine::{Engine, Inner, panic_message};
use crate::error::{Unhandled, UsageError};
use crate::fixed::Fixed32;
use crate::node::{
    Dependent, Handle, JoinState, Kind, ListenerRef, Node, Outcome, PassThrough, RaceState,
    SequenceStep, State, WaitState,
};

impl<V, E> Engine<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + std::fmt::Debug + 'static,
{
    /// Promise that resolves with every input's values in input order once
    /// all inputs resolve, or adopts the first failure immediately.
    pub fn all(&self, children: &[Handle]) -> Result<Handle, UsageError> {
        if children.is_empty() {
            return Err(UsageError::EmptyInput);
        }
        let mut inner = self.inner.lock();
        let mut max_whole = 0u32;
        let mut expected_wholes = 0f64;
        for h in children {
            let n = inner.nodes.get(h.0).ok_or(UsageError::StaleHandle)?;
            let w = self.scale.whole(n.depth);
            max_whole = max_whole.max(w);
            expected_wholes += f64::from(w) + 1.0;
        }
        let count = children.len();
        let mut node = Node::new(
            Kind::Join(JoinState {
                wait_count: count as u32,
                results: vec![None; count],
                passes: Vec::with_capacity(count),
                expected_units: expected_wholes * f64::from(self.scale.decimal_max()),
                current: Fixed32::ZERO,
                out: Fixed32::ZERO,
            }),
            self.scale.from_whole(max_whole),
        );
        // one retain per input edge, plus the seed
        node.retain = 1 + count as u32;
        let key = inner.nodes.insert(node);
        self.attach_passes(&mut inner, key, children);
        Ok(Handle(key))
    }

    /// Promise that adopts the first settlement among its inputs, whatever
    /// its kind.
    pub fn race(&self, children: &[Handle]) -> Result<Handle, UsageError> {
        self.race_like(children, false)
    }

    /// Promise that adopts the first resolution among its inputs; failures
    /// only win once every input has failed, and then the last one is
    /// adopted.
    pub fn first(&self, children: &[Handle]) -> Result<Handle, UsageError> {
        self.race_like(children, true)
    }

    fn race_like(&self, children: &[Handle], first: bool) -> Result<Handle, UsageError> {
        if children.is_empty() {
            return Err(UsageError::EmptyInput);
        }
        let mut inner = self.inner.lock();
        let mut min_whole = u32::MAX;
        for h in children {
            let n = inner.nodes.get(h.0).ok_or(UsageError::StaleHandle)?;
            min_whole = min_whole.min(self.scale.whole(n.depth));
        }
        let count = children.len() as u32;
        let state = RaceState {
            wait_count: count,
            passes: Vec::with_capacity(children.len()),
            current: Fixed32::ZERO,
        };
        let kind = if first {
            Kind::First(state)
        } else {
            Kind::Race(state)
        };
        let mut node = Node::new(kind, self.scale.from_whole(min_whole));
        node.retain = 1 + count;
        let key = inner.nodes.insert(node);
        self.attach_passes(&mut inner, key, children);
        Ok(Handle(key))
    }

    fn attach_passes(&self, inner: &mut Inner<V, E>, target: Key, children: &[Handle]) {
        for (index, h) in children.iter().enumerate() {
            let owner_full = match inner.nodes.get(h.0) {
                Some(c) => self.scale.incremented_whole(c.depth).raw(),
                None => continue,
            };
            let pass = inner.passes.insert(PassThrough {
                owner: h.0,
                target,
                index: index as u32,
                current: Fixed32::ZERO,
                owner_full,
                registered: false,
            });
            if let Some(node) = inner.nodes.get_mut(target) {
                match &mut node.kind {
                    Kind::Join(js) => js.passes.push(pass),
                    Kind::Race(rs) | Kind::First(rs) => rs.passes.push(pass),
                    _ => {}
                }
            }
            if let Some(child) = inner.nodes.get_mut(h.0) {
                child.dependents.push(Dependent::Pass(pass));
                self.requeue(child, h.0);
            }
        }
    }

    /// Run `steps` one at a time; each factory is invoked only after the
    /// previous step's promise resolves. Settles with the last step's
    /// outcome, or aborts with the first failure. An empty sequence is
    /// already resolved.
    pub fn sequence(&self, steps: Vec<SequenceStep>) -> Result<Handle, UsageError> {
        let total = steps.len();
        let mut queue: VecDeque<SequenceStep> = steps.into_iter().collect();
        let Some(factory) = queue.pop_front() else {
            return Ok(self.create_settled(Outcome::ResolvedMany(Vec::new())));
        };
        // factories are user code and run with the graph lock released
        let previous = match catch_unwind(AssertUnwindSafe(factory)) {
            Ok(handle) => Some(handle),
            Err(payload) => {
                let message = panic_message(payload);
                warn!(panic = %message, "sequence step factory panicked");
                self.unhandled.lock().push(Unhandled::CallbackPanic(message));
                None
            }
        };
        let mut inner = self.inner.lock();
        let prev_full = previous
            .and_then(|h| inner.nodes.get(h.0))
            .map(|n| self.scale.incremented_whole(n.depth).raw())
            .unwrap_or_else(|| self.scale.decimal_max());
        let node = Node::new(
            Kind::Wait(WaitState {
                previous: previous.map(|h| h.0),
                steps: queue,
                scaled: true,
                adopted: Fixed32::ZERO,
                prev_units: Fixed32::ZERO,
                prev_full,
                sent: Fixed32::ZERO,
                registered: false,
            }),
            self.scale.from_whole((total - 1) as u32),
        );
        let key = inner.nodes.insert(node);
        if let Some(h) = previous {
            if let Some(prev) = inner.nodes.get_mut(h.0) {
                prev.dependents.push(Dependent::Wait(key));
                self.requeue(prev, h.0);
            }
        }
        Ok(Handle(key))
    }

    /// One combinator input settled. Consumes the pass-through, feeds the
    /// result into the target, and gives back the input edge's retain.
    pub(crate) fn fire_pass(&self, pass: Key, outcome: &Outcome<V, E>) {
        let mut inner = self.inner.lock();
        let Some(pass) = inner.passes.remove(pass) else {
            return;
        };
        let target = pass.target;
        let mut settle_with: Option<Outcome<V, E>> = None;
        let mut work: VecDeque<(ListenerRef, u32)> = VecDeque::new();
        {
            let Some(node) = inner.nodes.get_mut(target) else {
                return;
            };
            if node.state == State::Pending {
                let parent_full = f64::from(self.scale.decimal_max())
                    * f64::from(self.scale.whole(node.depth) + 1);
                match &mut node.kind {
                    Kind::Join(js) => {
                        if outcome.is_failure() {
                            settle_with = Some(outcome.clone());
                        } else {
                            js.wait_count -= 1;
                            // complete this input's span in the accumulators;
                            // zero when bubbling already brought it there
                            let delta = pass.owner_full.wrapping_sub(pass.current.raw());
                            js.current.increment(delta);
                            let f = f64::from(js.current.raw()) / js.expected_units;
                            let out_new = (f * parent_full) as u32;
                            let delta_out = out_new.wrapping_sub(js.out.raw());
                            js.out = Fixed32::from_raw(out_new);
                            let values = match outcome {
                                Outcome::Resolved(v) => vec![v.clone()],
                                Outcome::ResolvedMany(vs) => vs.clone(),
                                _ => Vec::new(),
                            };
                            js.results[pass.index as usize] = Some(values);
                            if js.wait_count == 0 {
                                let all: Vec<V> = js
                                    .results
                                    .iter_mut()
                                    .filter_map(|slot| slot.take())
                                    .flatten()
                                    .collect();
                                settle_with = Some(Outcome::ResolvedMany(all));
                            } else if delta_out != 0 {
                                for l in node.progress.iter().copied() {
                                    work.push_back((l, delta_out));
                                }
                            }
                        }
                    }
                    Kind::Race(_) => settle_with = Some(outcome.clone()),
                    Kind::First(rs) => {
                        if outcome.is_failure() {
                            rs.wait_count -= 1;
                            if rs.wait_count == 0 {
                                settle_with = Some(outcome.clone());
                            }
                        } else {
                            settle_with = Some(outcome.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        if !work.is_empty() {
            self.bubble(&mut inner, work);
        }
        if let Some(decided) = settle_with {
            self.settle_locked(&mut inner, target, decided);
        }
        self.release_locked(&mut inner, target);
    }
}
