//! Promise engine: graph storage, settlement, and the completion drain.
//!
//! The whole promise graph lives behind one [`parking_lot::Mutex`]. Producers
//! on any thread may create, settle, and subscribe; callbacks only ever run
//! on the thread that calls [`Engine::handle_completes`], and always with the
//! graph lock released. Lock order is graph, then a scheduler queue or the
//! unhandled-failure sink; no code path takes them the other way around.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::arena::{Arena, Key};
use crate::error::{Unhandled, UnhandledReport, UsageError};
use crate::fixed::{Fixed32, FixedScale};
use crate::node::{
    Config, Dependent, Handle, Kind, ListenerRef, Node, Outcome, PassThrough, ProgressSub,
    SettleCallback, State, WaitState,
};
use crate::queue::DrainQueue;

pub(crate) struct Inner<V, E> {
    pub nodes: Arena<Node<V, E>>,
    pub passes: Arena<PassThrough>,
    pub subs: Arena<ProgressSub>,
}

/// The promise engine. One instance owns its graph and its scheduler queues;
/// independent engines never interact.
pub struct Engine<V, E> {
    pub(crate) inner: Mutex<Inner<V, E>>,
    /// Resolved/rejected nodes whose dependents are ready to be notified.
    pub(crate) handle_queue: DrainQueue<Key>,
    /// Canceled nodes; drained before everything else.
    pub(crate) cancel_queue: DrainQueue<Key>,
    /// Progress subscriptions with a pending invocation.
    pub(crate) progress_queue: DrainQueue<Key>,
    pub(crate) unhandled: Mutex<Vec<Unhandled<E>>>,
    /// Reentrancy guard: a drain started from inside a callback is a no-op,
    /// the outer drain picks the new items up.
    running_completes: AtomicBool,
    pub(crate) scale: FixedScale,
    config: Config,
}

impl<V, E> Engine<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new(config: Config) -> Result<Self, UsageError> {
        let scale = FixedScale::new(config.progress_decimal_bits)
            .ok_or(UsageError::InvalidProgressBits(config.progress_decimal_bits))?;
        Ok(Self {
            inner: Mutex::new(Inner {
                nodes: Arena::new(config.pooling),
                passes: Arena::new(config.pooling),
                subs: Arena::new(config.pooling),
            }),
            handle_queue: DrainQueue::new(),
            cancel_queue: DrainQueue::new(),
            progress_queue: DrainQueue::new(),
            unhandled: Mutex::new(Vec::new()),
            running_completes: AtomicBool::new(false),
            scale,
            config,
        })
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// New pending leaf promise at depth zero. Starts with the engine's seed
    /// retain, released after the first post-settlement processing.
    pub fn create(&self) -> Handle {
        let key = self
            .inner
            .lock()
            .nodes
            .insert(Node::new(Kind::Leaf, Fixed32::ZERO));
        Handle(key)
    }

    /// Already-settled leaf. Queued immediately so an unobserved failure
    /// still surfaces on the next drain.
    pub fn create_settled(&self, outcome: Outcome<V, E>) -> Handle {
        let mut node = Node::new(Kind::Leaf, Fixed32::ZERO);
        let state = outcome.state();
        node.state = state;
        node.outcome = Some(outcome);
        let key = self.inner.lock().nodes.insert(node);
        if state == State::Canceled {
            self.cancel_queue.push_back(key);
        } else {
            self.handle_queue.push_back(key);
        }
        Handle(key)
    }

    /// New promise one link deeper that adopts `previous`'s outcome when it
    /// settles.
    pub fn chain(&self, previous: Handle) -> Result<Handle, UsageError> {
        let mut inner = self.inner.lock();
        let Some(prev) = inner.nodes.get(previous.0) else {
            return Err(UsageError::StaleHandle);
        };
        let depth = self.scale.incremented_whole(prev.depth);
        let prev_full = depth.raw();
        let node = Node::new(
            Kind::Wait(WaitState {
                previous: Some(previous.0),
                steps: std::collections::VecDeque::new(),
                scaled: false,
                adopted: Fixed32::ZERO,
                prev_units: Fixed32::ZERO,
                prev_full,
                sent: Fixed32::ZERO,
                registered: false,
            }),
            depth,
        );
        let key = inner.nodes.insert(node);
        if let Some(prev) = inner.nodes.get_mut(previous.0) {
            prev.dependents.push(Dependent::Wait(key));
            self.requeue(prev, previous.0);
        }
        Ok(Handle(key))
    }

    pub fn state(&self, handle: Handle) -> Result<State, UsageError> {
        self.inner
            .lock()
            .nodes
            .get(handle.0)
            .map(|n| n.state)
            .ok_or(UsageError::StaleHandle)
    }

    /// Clone of the terminal outcome, `None` while pending.
    pub fn outcome(&self, handle: Handle) -> Result<Option<Outcome<V, E>>, UsageError> {
        self.inner
            .lock()
            .nodes
            .get(handle.0)
            .map(|n| n.outcome.clone())
            .ok_or(UsageError::StaleHandle)
    }

    pub fn retain(&self, handle: Handle) -> Result<(), UsageError> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(handle.0)
            .ok_or(UsageError::StaleHandle)?;
        node.retain = node.retain.saturating_add(1);
        Ok(())
    }

    /// Give back one retain. Dropping the last retain of a settled promise
    /// returns it to the pool; the engine's own seed retain on a pending
    /// promise cannot be released this way.
    pub fn release(&self, handle: Handle) -> Result<(), UsageError> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(handle.0)
            .ok_or(UsageError::StaleHandle)?;
        let rest = node
            .retain
            .checked_sub(1)
            .ok_or(UsageError::RetainUnderflow)?;
        if rest == 0 {
            if node.state == State::Pending {
                return Err(UsageError::RetainUnderflow);
            }
            node.retain = 0;
            self.dispose_locked(&mut inner, handle.0);
        } else {
            node.retain = rest;
        }
        Ok(())
    }

    /// Attach a completion callback. Runs during a drain, after settlement,
    /// in attach order.
    pub fn on_settled(&self, handle: Handle, callback: SettleCallback<V, E>) -> Result<(), UsageError> {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .get_mut(handle.0)
            .ok_or(UsageError::StaleHandle)?;
        node.dependents.push(Dependent::Callback(callback));
        self.requeue(node, handle.0);
        Ok(())
    }

    /// Settle if still pending; `Ok(false)` when another settlement won.
    pub fn try_settle(&self, handle: Handle, outcome: Outcome<V, E>) -> Result<bool, UsageError> {
        let mut inner = self.inner.lock();
        if !inner.nodes.contains(handle.0) {
            return Err(UsageError::StaleHandle);
        }
        Ok(self.settle_locked(&mut inner, handle.0, outcome))
    }

    /// Strict settle: losing the settlement race is a usage error.
    pub fn settle(&self, handle: Handle, outcome: Outcome<V, E>) -> Result<(), UsageError> {
        if self.try_settle(handle, outcome)? {
            Ok(())
        } else {
            Err(UsageError::AlreadySettled)
        }
    }

    /// Drain canceled and completed promises, invoking their dependents on
    /// this thread. Returns the unobserved failures collected since the last
    /// drain.
    pub fn handle_completes(&self) -> Result<(), UnhandledReport<E>> {
        if self.running_completes.swap(true, Ordering::Acquire) {
            return Ok(());
        }
        loop {
            if let Some(key) = self.cancel_queue.pop() {
                self.process_settled(key);
                continue;
            }
            if let Some(key) = self.handle_queue.pop() {
                self.process_settled(key);
                continue;
            }
            break;
        }
        self.running_completes.store(false, Ordering::Release);
        self.take_unhandled()
    }

    /// Like [`Engine::handle_completes`], additionally invoking pending
    /// progress notifications. Completions always come first.
    pub fn handle_completes_and_progress(&self) -> Result<(), UnhandledReport<E>> {
        if self.running_completes.swap(true, Ordering::Acquire) {
            return Ok(());
        }
        loop {
            if let Some(key) = self.cancel_queue.pop() {
                self.process_settled(key);
                continue;
            }
            if let Some(key) = self.handle_queue.pop() {
                self.process_settled(key);
                continue;
            }
            if let Some(sub) = self.progress_queue.pop() {
                self.invoke_progress(sub);
                continue;
            }
            break;
        }
        self.running_completes.store(false, Ordering::Release);
        self.take_unhandled()
    }

    /// Drop every free list so recycled slots are not kept around.
    pub fn clear_pools(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear_pool();
        inner.passes.clear_pool();
        inner.subs.clear_pool();
    }

    /// Live object count across all arenas. Test and diagnostics aid.
    pub fn live_objects(&self) -> usize {
        let inner = self.inner.lock();
        inner.nodes.len() + inner.passes.len() + inner.subs.len()
    }

    fn take_unhandled(&self) -> Result<(), UnhandledReport<E>> {
        let entries = std::mem::take(&mut *self.unhandled.lock());
        if entries.is_empty() {
            Ok(())
        } else {
            Err(UnhandledReport::new(entries))
        }
    }

    /// Settlement under the graph lock: flip the state, freeze progress,
    /// flush progress listeners, enqueue for the drain.
    pub(crate) fn settle_locked(
        &self,
        inner: &mut Inner<V, E>,
        key: Key,
        outcome: Outcome<V, E>,
    ) -> bool {
        let Some(node) = inner.nodes.get_mut(key) else {
            return false;
        };
        if node.state.is_settled() {
            return false;
        }
        let state = outcome.state();
        node.state = state;
        node.outcome = Some(outcome);
        self.settle_flush(inner, key, state == State::Resolved);
        if state == State::Canceled {
            self.cancel_queue.push_back(key);
        } else {
            self.handle_queue.push_back(key);
        }
        true
    }

    /// Re-enqueue a settled node whose first processing already happened, so
    /// a late-attached dependent still gets notified.
    pub(crate) fn requeue(&self, node: &Node<V, E>, key: Key) {
        if node.state.is_settled() && node.seed_released {
            if node.state == State::Canceled {
                self.cancel_queue.push_back(key);
            } else {
                self.handle_queue.push_back(key);
            }
        }
    }

    fn process_settled(&self, key: Key) {
        let (dependents, outcome, release_seed) = {
            let mut inner = self.inner.lock();
            let Some(node) = inner.nodes.get_mut(key) else {
                return;
            };
            if !node.state.is_settled() {
                return;
            }
            let Some(outcome) = node.outcome.clone() else {
                return;
            };
            let dependents = std::mem::take(&mut node.dependents);
            let release_seed = !node.seed_released;
            node.seed_released = true;
            let consumed = dependents.iter().any(|d| {
                matches!(
                    d,
                    Dependent::Callback(_) | Dependent::Wait(_) | Dependent::Pass(_)
                )
            });
            if outcome.is_failure() && consumed {
                node.observed = true;
            }
            (dependents, outcome, release_seed)
        };
        for dependent in dependents {
            match dependent {
                Dependent::Callback(callback) => self.run_settle_callback(callback, &outcome),
                Dependent::Wait(waiter) => self.adopt_wait(waiter, key, &outcome),
                Dependent::Pass(pass) => self.fire_pass(pass, &outcome),
                Dependent::ProgressResolved(sub) => self.finish_progress(sub),
            }
        }
        if release_seed {
            let mut inner = self.inner.lock();
            self.release_locked(&mut inner, key);
        }
    }

    fn run_settle_callback(&self, callback: SettleCallback<V, E>, outcome: &Outcome<V, E>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
            let message = panic_message(payload);
            warn!(panic = %message, "completion callback panicked");
            self.unhandled.lock().push(Unhandled::CallbackPanic(message));
        }
    }

    /// The final `1.0` progress invocation, folded into the owner's resolve
    /// notification. Consumes the subscription.
    fn finish_progress(&self, sub: Key) {
        let taken = self.inner.lock().subs.remove(sub);
        let Some(sub) = taken else { return };
        if let Some(mut callback) = sub.callback {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(1.0))) {
                let message = panic_message(payload);
                warn!(panic = %message, "progress callback panicked");
                self.unhandled.lock().push(Unhandled::CallbackPanic(message));
            }
        }
    }

    /// A waiter's previous settled: adopt the failure, settle with the
    /// adopted resolution, or run the next sequence step.
    fn adopt_wait(&self, waiter: Key, sender: Key, outcome: &Outcome<V, E>) {
        let step = {
            let mut inner = self.inner.lock();
            let Some(sender_node) = inner.nodes.get(sender) else {
                return;
            };
            let sender_full = self.scale.incremented_whole(sender_node.depth).raw();
            let Some(node) = inner.nodes.get_mut(waiter) else {
                return;
            };
            if node.state.is_settled() {
                return;
            }
            let Kind::Wait(ws) = &mut node.kind else {
                return;
            };
            let step = if outcome.is_failure() {
                None
            } else {
                let banked = if ws.scaled {
                    self.scale.decimal_max()
                } else {
                    sender_full
                };
                ws.adopted.increment(banked);
                ws.prev_units = Fixed32::ZERO;
                ws.previous = None;
                ws.steps.pop_front()
            };
            if outcome.is_failure() || step.is_none() {
                self.settle_locked(&mut inner, waiter, outcome.clone());
                return;
            }
            step
        };
        let Some(factory) = step else { return };
        // The factory is user code and may call back into the engine; run it
        // with the graph lock released.
        let next = match catch_unwind(AssertUnwindSafe(factory)) {
            Ok(handle) => handle,
            Err(payload) => {
                let message = panic_message(payload);
                warn!(panic = %message, "sequence step factory panicked");
                self.unhandled.lock().push(Unhandled::CallbackPanic(message));
                return;
            }
        };
        let mut inner = self.inner.lock();
        let next_full = match inner.nodes.get(next.0) {
            Some(n) => self.scale.incremented_whole(n.depth).raw(),
            None => return,
        };
        let registered = {
            let Some(node) = inner.nodes.get_mut(waiter) else {
                return;
            };
            let Kind::Wait(ws) = &mut node.kind else {
                return;
            };
            ws.previous = Some(next.0);
            ws.prev_full = next_full;
            ws.registered
        };
        if let Some(next_node) = inner.nodes.get_mut(next.0) {
            next_node.dependents.push(Dependent::Wait(waiter));
            if registered && next_node.state == State::Pending {
                next_node.progress.push(ListenerRef::Node(waiter));
            }
            self.requeue(next_node, next.0);
        }
        if registered {
            self.link_down(&mut inner, next.0);
        }
    }

    pub(crate) fn release_locked(&self, inner: &mut Inner<V, E>, key: Key) {
        let Some(node) = inner.nodes.get_mut(key) else {
            return;
        };
        node.retain = node.retain.saturating_sub(1);
        if node.retain == 0 {
            self.dispose_locked(inner, key);
        }
    }

    /// Return a node to the pool. The last place an unobserved failure can
    /// still be reported.
    pub(crate) fn dispose_locked(&self, inner: &mut Inner<V, E>, key: Key) {
        let Some(node) = inner.nodes.remove(key) else {
            return;
        };
        trace!(index = key.index, "promise disposed");
        if node.observed {
            return;
        }
        match node.outcome {
            Some(Outcome::Rejected(reason)) => {
                self.unhandled.lock().push(Unhandled::Rejection(reason));
            }
            Some(Outcome::Canceled(reason)) => {
                self.unhandled.lock().push(Unhandled::Cancelation(reason));
            }
            _ => {}
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic payload of unknown type".to_string()
    }
}
