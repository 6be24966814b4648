//! Normalized progress propagation.
//!
//! Subscribing walks the chain from the subscribed promise down to the
//! deepest pending work, linking each node as a listener on the one below it
//! (and combinator pass-throughs on each pending input). From then on,
//! reported fractions bubble upward as fixed-point deltas under the graph
//! lock; only the final callback invocations go through the progress queue
//! and run on the draining thread.
//!
//! When a link resolves it sends exactly the units missing from its full
//! span, so every listener's accumulator lands on `(depth + 1)` wholes by
//! the time the subscribed promise resolves. The `1.0` itself is never sent
//! as a progress delta; it is folded into the resolve notification.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::warn;

use crate::arena::Key;
use crate::engine::{Engine, Inner, panic_message};
use crate::error::{Unhandled, UsageError};
use crate::fixed::Fixed32;
use crate::node::{
    Dependent, Handle, Kind, ListenerRef, ProgressCallback, ProgressSub, State, WaitState,
};

impl<V, E> Engine<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + std::fmt::Debug + 'static,
{
    /// Report this promise's own progress in `[0, 1)`. Only meaningful for
    /// leaf promises backed by a deferred; ignored once settled. The full
    /// `1.0` only ever arrives through resolution.
    pub fn report_progress(&self, handle: Handle, fraction: f64) -> Result<(), UsageError> {
        if !(0.0..1.0).contains(&fraction) {
            warn!(fraction, "progress report out of [0, 1) ignored");
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.get_mut(handle.0) else {
            return Err(UsageError::StaleHandle);
        };
        if node.state.is_settled() || !matches!(node.kind, Kind::Leaf) {
            warn!("progress report on a settled or derived promise ignored");
            return Ok(());
        }
        let delta = self.scale.assign_fraction(&mut node.depth, fraction);
        if delta == 0 || node.progress.is_empty() {
            return Ok(());
        }
        let work: VecDeque<(ListenerRef, u32)> =
            node.progress.iter().copied().map(|l| (l, delta)).collect();
        self.bubble(&mut inner, work);
        Ok(())
    }

    /// Subscribe to normalized progress of `handle`. The callback receives
    /// values in `[0, 1]`, invoked on the draining thread; the current value
    /// is delivered promptly after subscribing. Subscribing to an already
    /// resolved promise delivers a single `1.0`; to a failed promise,
    /// nothing.
    pub fn on_progress(&self, handle: Handle, callback: ProgressCallback) -> Result<(), UsageError> {
        let mut inner = self.inner.lock();
        let (state, denominator) = {
            let Some(node) = inner.nodes.get(handle.0) else {
                return Err(UsageError::StaleHandle);
            };
            (node.state, f64::from(self.scale.whole(node.depth) + 1))
        };
        match state {
            State::Resolved => {
                let sub = inner.subs.insert(ProgressSub {
                    callback: Some(callback),
                    current: Fixed32::ZERO,
                    denominator,
                    handling: false,
                    done: true,
                });
                if let Some(node) = inner.nodes.get_mut(handle.0) {
                    node.dependents.push(Dependent::ProgressResolved(sub));
                    self.requeue(node, handle.0);
                }
            }
            State::Rejected | State::Canceled => {}
            State::Pending => {
                self.link_down(&mut inner, handle.0);
                let initial = self.node_value(&inner, handle.0);
                let sub = inner.subs.insert(ProgressSub {
                    callback: Some(callback),
                    current: Fixed32::from_raw(initial),
                    denominator,
                    handling: true,
                    done: false,
                });
                if let Some(node) = inner.nodes.get_mut(handle.0) {
                    node.progress.push(ListenerRef::Sub(sub));
                }
                self.progress_queue.push_back(sub);
            }
        }
        Ok(())
    }

    /// Flush progress listeners at settlement, under the graph lock. On
    /// resolution every non-sub listener receives the units missing from
    /// this node's full span; subs get their `1.0` folded into the resolve
    /// notification. On failure all listeners are detached silently.
    pub(crate) fn settle_flush(&self, inner: &mut Inner<V, E>, key: Key, resolved: bool) {
        let (listeners, amount) = {
            let Some(node) = inner.nodes.get_mut(key) else {
                return;
            };
            if node.progress.is_empty() {
                return;
            }
            let listeners = std::mem::take(&mut node.progress);
            let amount = if resolved {
                let full = self.scale.incremented_whole(node.depth).raw();
                let sent = match &node.kind {
                    Kind::Leaf => self.scale.fraction_units(node.depth),
                    Kind::Wait(ws) => ws.sent.raw(),
                    Kind::Join(js) => js.out.raw(),
                    Kind::Race(rs) | Kind::First(rs) => rs.current.raw(),
                };
                full.wrapping_sub(sent)
            } else {
                0
            };
            (listeners, amount)
        };
        let mut work = VecDeque::new();
        let mut folded: Vec<Key> = Vec::new();
        for listener in listeners {
            match listener {
                ListenerRef::Sub(sub) => {
                    if resolved {
                        if let Some(s) = inner.subs.get_mut(sub) {
                            s.done = true;
                            folded.push(sub);
                        }
                    } else {
                        inner.subs.remove(sub);
                    }
                }
                other => {
                    if resolved && amount != 0 {
                        work.push_back((other, amount));
                    }
                }
            }
        }
        if let Some(node) = inner.nodes.get_mut(key) {
            for sub in folded {
                node.dependents.push(Dependent::ProgressResolved(sub));
            }
        }
        if !work.is_empty() {
            self.bubble(inner, work);
        }
    }

    /// Propagate fixed-point deltas up through the listener graph. Runs
    /// under the graph lock; user callbacks are only scheduled, never
    /// invoked, from here.
    pub(crate) fn bubble(&self, inner: &mut Inner<V, E>, mut work: VecDeque<(ListenerRef, u32)>) {
        while let Some((listener, delta)) = work.pop_front() {
            match listener {
                ListenerRef::Sub(sub) => {
                    let Some(s) = inner.subs.get_mut(sub) else {
                        continue;
                    };
                    if s.done {
                        continue;
                    }
                    s.current.increment(delta);
                    if !s.handling {
                        s.handling = true;
                        self.progress_queue.push_back(sub);
                    }
                }
                ListenerRef::Node(waiter) => {
                    let Some(node) = inner.nodes.get_mut(waiter) else {
                        continue;
                    };
                    if node.state.is_settled() {
                        continue;
                    }
                    let Kind::Wait(ws) = &mut node.kind else {
                        continue;
                    };
                    ws.prev_units.increment(delta);
                    let out = self.wait_out(ws);
                    let delta_out = out.wrapping_sub(ws.sent.raw());
                    ws.sent = Fixed32::from_raw(out);
                    if delta_out != 0 {
                        for l in node.progress.iter().copied() {
                            work.push_back((l, delta_out));
                        }
                    }
                }
                ListenerRef::Pass(pass) => {
                    let (pass_units, owner_full, target) = {
                        let Some(p) = inner.passes.get_mut(pass) else {
                            continue;
                        };
                        p.current.increment(delta);
                        (p.current.raw(), p.owner_full, p.target)
                    };
                    let Some(node) = inner.nodes.get_mut(target) else {
                        continue;
                    };
                    if node.state.is_settled() {
                        continue;
                    }
                    let parent_full = f64::from(self.scale.decimal_max())
                        * f64::from(self.scale.whole(node.depth) + 1);
                    let delta_out = match &mut node.kind {
                        Kind::Join(js) => {
                            js.current.increment(delta);
                            let f = f64::from(js.current.raw()) / js.expected_units;
                            let out_new = (f * parent_full) as u32;
                            let d = out_new.wrapping_sub(js.out.raw());
                            js.out = Fixed32::from_raw(out_new);
                            d
                        }
                        Kind::Race(rs) | Kind::First(rs) => {
                            // max-combine: a slower input never regresses the
                            // fastest one
                            let norm = f64::from(pass_units) / f64::from(owner_full.max(1));
                            let candidate = (norm * parent_full) as u32;
                            if candidate > rs.current.raw() {
                                let d = candidate - rs.current.raw();
                                rs.current = Fixed32::from_raw(candidate);
                                d
                            } else {
                                0
                            }
                        }
                        _ => 0,
                    };
                    if delta_out != 0 {
                        for l in node.progress.iter().copied() {
                            work.push_back((l, delta_out));
                        }
                    }
                }
            }
        }
    }

    /// Units this waiter has produced for its listeners: banked adoptions
    /// plus the live previous chain, compressed to one whole for sequence
    /// steps.
    fn wait_out(&self, ws: &WaitState) -> u32 {
        let below = if ws.scaled {
            (u64::from(ws.prev_units.raw()) * u64::from(self.scale.decimal_max())
                / u64::from(ws.prev_full.max(1))) as u32
        } else {
            ws.prev_units.raw()
        };
        ws.adopted.raw().wrapping_add(below)
    }

    /// Link `start` and everything below it into the progress listener
    /// graph. One iterative descent marks every link and records the new
    /// edges; a second pass preloads the accumulators bottom-up so late
    /// subscriptions start from the progress already made. Neither pass
    /// grows the call stack with chain depth or tree width.
    pub(crate) fn link_down(&self, inner: &mut Inner<V, E>, start: Key) {
        enum Edge {
            Wait { parent: Key, child: Key },
            Pass(Key),
        }
        enum Links {
            Prev(Option<Key>),
            Passes(Vec<Key>),
        }
        let mut stack = vec![start];
        let mut edges: Vec<Edge> = Vec::new();
        while let Some(key) = stack.pop() {
            let links = {
                let Some(node) = inner.nodes.get(key) else {
                    continue;
                };
                if node.state.is_settled() {
                    continue;
                }
                match &node.kind {
                    Kind::Leaf => continue,
                    Kind::Wait(ws) if ws.registered => continue,
                    Kind::Wait(ws) => Links::Prev(ws.previous),
                    Kind::Join(js) => Links::Passes(js.passes.clone()),
                    Kind::Race(rs) | Kind::First(rs) => Links::Passes(rs.passes.clone()),
                }
            };
            match links {
                Links::Prev(previous) => {
                    let live = previous.filter(|p| {
                        matches!(inner.nodes.get(*p), Some(n) if n.state == State::Pending)
                    });
                    if let Some(node) = inner.nodes.get_mut(key) {
                        if let Kind::Wait(ws) = &mut node.kind {
                            ws.registered = true;
                            if live.is_none() {
                                ws.sent = Fixed32::from_raw(self.wait_out(ws));
                            }
                        }
                    }
                    if let Some(prev) = live {
                        if let Some(prev_node) = inner.nodes.get_mut(prev) {
                            prev_node.progress.push(ListenerRef::Node(key));
                        }
                        edges.push(Edge::Wait { parent: key, child: prev });
                        stack.push(prev);
                    }
                }
                Links::Passes(passes) => {
                    for pk in passes {
                        let owner = {
                            let Some(p) = inner.passes.get(pk) else {
                                continue;
                            };
                            if p.registered {
                                continue;
                            }
                            p.owner
                        };
                        let pending = matches!(
                            inner.nodes.get(owner),
                            Some(n) if n.state == State::Pending
                        );
                        if !pending {
                            continue;
                        }
                        if let Some(p) = inner.passes.get_mut(pk) {
                            p.registered = true;
                        }
                        if let Some(owner_node) = inner.nodes.get_mut(owner) {
                            owner_node.progress.push(ListenerRef::Pass(pk));
                        }
                        edges.push(Edge::Pass(pk));
                        stack.push(owner);
                    }
                }
            }
        }
        // Deeper edges were recorded later, so walking the record backwards
        // preloads every edge's child side before its parent reads it.
        for edge in edges.into_iter().rev() {
            match edge {
                Edge::Wait { parent, child } => {
                    let units = self.node_value(inner, child);
                    if let Some(node) = inner.nodes.get_mut(parent) {
                        if let Kind::Wait(ws) = &mut node.kind {
                            ws.prev_units = Fixed32::from_raw(units);
                            ws.sent = Fixed32::from_raw(self.wait_out(ws));
                        }
                    }
                }
                Edge::Pass(pk) => {
                    let (owner, target, owner_full) = {
                        let Some(p) = inner.passes.get(pk) else {
                            continue;
                        };
                        (p.owner, p.target, p.owner_full)
                    };
                    let units = self.node_value(inner, owner);
                    if let Some(p) = inner.passes.get_mut(pk) {
                        p.current = Fixed32::from_raw(units);
                    }
                    // fold the preload into the combinator's accumulators
                    // without forwarding; subscribers read it as their
                    // initial value instead
                    if let Some(node) = inner.nodes.get_mut(target) {
                        let parent_full = f64::from(self.scale.decimal_max())
                            * f64::from(self.scale.whole(node.depth) + 1);
                        match &mut node.kind {
                            Kind::Join(js) => {
                                js.current.increment(units);
                                let f = f64::from(js.current.raw()) / js.expected_units;
                                js.out = Fixed32::from_raw((f * parent_full) as u32);
                            }
                            Kind::Race(rs) | Kind::First(rs) => {
                                let norm = f64::from(units) / f64::from(owner_full.max(1));
                                let candidate = (norm * parent_full) as u32;
                                if candidate > rs.current.raw() {
                                    rs.current = Fixed32::from_raw(candidate);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
    }

    /// Units of progress currently accumulated at `key`, in its own chain
    /// space, read off the live accumulators. The subtree below must already
    /// be linked by [`Engine::link_down`] for the value to be current.
    pub(crate) fn node_value(&self, inner: &Inner<V, E>, key: Key) -> u32 {
        let Some(node) = inner.nodes.get(key) else {
            return 0;
        };
        if node.state.is_settled() {
            return 0;
        }
        match &node.kind {
            Kind::Leaf => self.scale.fraction_units(node.depth),
            Kind::Wait(ws) => self.wait_out(ws),
            Kind::Join(js) => js.out.raw(),
            Kind::Race(rs) | Kind::First(rs) => rs.current.raw(),
        }
    }

    /// Deliver one queued progress invocation on the draining thread.
    pub(crate) fn invoke_progress(&self, sub: Key) {
        let (callback, value, reported) = {
            let mut inner = self.inner.lock();
            let Some(s) = inner.subs.get_mut(sub) else {
                return;
            };
            if s.done {
                s.handling = false;
                return;
            }
            let value = (self.scale.to_f64(s.current) / s.denominator).clamp(0.0, 1.0);
            (s.callback.take(), value, s.current.raw())
        };
        let Some(mut callback) = callback else {
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(value))) {
            let message = panic_message(payload);
            warn!(panic = %message, "progress callback panicked");
            self.unhandled.lock().push(Unhandled::CallbackPanic(message));
        }
        let mut inner = self.inner.lock();
        if let Some(s) = inner.subs.get_mut(sub) {
            s.callback = Some(callback);
            s.handling = false;
            // more arrived while the callback ran; report again before any
            // newer subscriptions
            if !s.done && s.current.raw() != reported {
                s.handling = true;
                self.progress_queue.push_front(sub);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::engine::Engine;
    use crate::node::{Config, Outcome};

    fn engine() -> Engine<i32, String> {
        Engine::new(Config::default()).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, crate::node::ProgressCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |p| sink.lock().push(p)))
    }

    #[test]
    fn test_leaf_progress_reaches_subscriber() {
        let e = engine();
        let p = e.create();
        let (seen, cb) = recorder();
        e.on_progress(p, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.report_progress(p, 0.25).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.report_progress(p, 0.5).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.try_settle(p, Outcome::Resolved(1)).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_chain_normalizes_by_depth() {
        let e = engine();
        let p = e.create();
        let c = e.chain(p).unwrap();
        // progress made before anyone subscribed is preloaded
        e.report_progress(p, 0.5).unwrap();
        let (seen, cb) = recorder();
        e.on_progress(c, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.report_progress(p, 0.75).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.try_settle(p, Outcome::Resolved(1)).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[0.25, 0.375, 1.0]);
    }

    #[test]
    fn test_join_progress_staircase() {
        let e = engine();
        let a = e.create();
        let b = e.create();
        let ca = e.chain(a).unwrap();
        let cb = e.chain(b).unwrap();
        let all = e.all(&[ca, cb]).unwrap();
        let (seen, cb_progress) = recorder();
        e.on_progress(all, cb_progress).unwrap();
        e.handle_completes_and_progress().unwrap();
        // one chain half done: 0.5 of 4 expected wholes
        e.report_progress(a, 0.5).unwrap();
        e.handle_completes_and_progress().unwrap();
        // first chain fully done: 2 of 4
        e.try_settle(a, Outcome::Resolved(1)).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.try_settle(b, Outcome::Resolved(2)).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[0.0, 0.125, 0.5, 1.0]);
    }

    #[test]
    fn test_race_progress_is_maximum_of_inputs() {
        let e = engine();
        let a = e.create();
        let b = e.create();
        let race = e.race(&[a, b]).unwrap();
        let (seen, cb) = recorder();
        e.on_progress(race, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.report_progress(a, 0.25).unwrap();
        e.handle_completes_and_progress().unwrap();
        // the slower input never regresses the reported value
        e.report_progress(b, 0.125).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.report_progress(b, 0.5).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.try_settle(a, Outcome::Resolved(1)).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[0.0, 0.25, 0.5, 1.0]);
    }

    #[test]
    fn test_sequence_progress_counts_steps() {
        let e = engine();
        let l1 = e.create();
        let l2 = e.create();
        let seq = e
            .sequence(vec![Box::new(move || l1), Box::new(move || l2)])
            .unwrap();
        let (seen, cb) = recorder();
        e.on_progress(seq, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.try_settle(l1, Outcome::Resolved(1)).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.try_settle(l2, Outcome::Resolved(2)).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_subscribe_on_resolved_fires_once() {
        let e = engine();
        let p = e.create_settled(Outcome::Resolved(1));
        let (seen, cb) = recorder();
        e.on_progress(p, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[1.0]);
    }

    #[test]
    fn test_subscribe_on_failed_never_fires() {
        let e = engine();
        let p = e.create_settled(Outcome::Rejected("gone".to_string()));
        let (seen, cb) = recorder();
        e.on_progress(p, cb).unwrap();
        let _ = e.handle_completes_and_progress();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_failure_detaches_progress_listeners() {
        let e = engine();
        let p = e.create();
        let (seen, cb) = recorder();
        e.on_progress(p, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        e.on_settled(p, Box::new(|_| {})).unwrap();
        e.try_settle(p, Outcome::Canceled("stop".to_string())).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(&*seen.lock(), &[0.0], "no invocation after cancelation");
    }

    #[test]
    fn test_deep_chain_subscription_stays_iterative() {
        let e = engine();
        let root = e.create();
        let mut top = root;
        for _ in 0..200_000 {
            top = e.chain(top).unwrap();
        }
        e.report_progress(root, 0.5).unwrap();
        let (seen, cb) = recorder();
        e.on_progress(top, cb).unwrap();
        e.handle_completes_and_progress().unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0] > 0.0, "preloaded value reaches the top");
        // a later report climbs the registered chain without re-walking it
        e.report_progress(root, 0.75).unwrap();
        e.handle_completes_and_progress().unwrap();
        let values = seen.lock();
        assert_eq!(values.len(), 2);
        assert!(values[1] > values[0]);
    }

    #[test]
    fn test_progress_is_ignored_after_settlement() {
        let e = engine();
        let p = e.create();
        e.retain(p).unwrap();
        e.try_settle(p, Outcome::Resolved(1)).unwrap();
        e.report_progress(p, 0.5).unwrap();
        let _ = e.handle_completes_and_progress();
    }
}
