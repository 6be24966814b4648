//! Promise graph data model.
//!
//! A promise is a slot in the node arena. Behavior differences between leaf
//! promises, chained waiters, and the aggregate combinators are expressed as
//! a closed [`Kind`] union and dispatched by `match`, so the state machine is
//! exhaustiveness-checked instead of relying on override dispatch.
//!
//! ## Progress unit space
//!
//! Within one chain, progress is measured in fixed-point units where one
//! whole equals one completed link. A listener on a promise of depth `d`
//! normalizes by dividing its accumulated units by `d + 1`. A combinator
//! compresses a whole sub-tree into `d + 1` wholes of its own chain, so the
//! deltas it forwards upward are pre-scaled by that factor. Every node tracks
//! how many units it has already sent to its listeners, which makes the final
//! resolve amount a plain subtraction from `(d + 1)` wholes.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::arena::Key;
use crate::fixed::Fixed32;

/// Public generation-checked promise handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub(crate) Key);

/// Promise state. Transitions are monotone: `Pending` settles into exactly
/// one terminal state and never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Resolved,
    Rejected,
    Canceled,
}

impl State {
    pub fn is_settled(self) -> bool {
        self != State::Pending
    }
}

/// Terminal outcome delivered to completion listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<V, E> {
    Resolved(V),
    /// Aggregate resolution of an All/Merge join, child values in input
    /// order.
    ResolvedMany(Vec<V>),
    Rejected(E),
    Canceled(E),
}

impl<V, E> Outcome<V, E> {
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) | Outcome::ResolvedMany(_) => State::Resolved,
            Outcome::Rejected(_) => State::Rejected,
            Outcome::Canceled(_) => State::Canceled,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Rejected(_) | Outcome::Canceled(_))
    }
}

/// Completion callback attached by the host.
pub type SettleCallback<V, E> = Box<dyn FnOnce(&Outcome<V, E>) + Send>;

/// Progress callback; receives normalized progress in `[0, 1]`.
pub type ProgressCallback = Box<dyn FnMut(f64) + Send>;

/// Factory for one sequence step, invoked after the previous step resolves.
pub type SequenceStep = Box<dyn FnOnce() -> Handle + Send>;

/// A downstream edge notified when the node settles, in FIFO attach order.
pub(crate) enum Dependent<V, E> {
    /// Host completion listener.
    Callback(SettleCallback<V, E>),
    /// Chained waiter node that adopts this node's outcome.
    Wait(Key),
    /// Pass-through edge into a combinator parent.
    Pass(Key),
    /// Progress subscription owed its final `1.0` invocation, folded into
    /// the resolve notification instead of a discrete progress event.
    ProgressResolved(Key),
}

/// A progress listener registered on a node, in subscription order.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ListenerRef {
    /// Host progress subscription made directly on this node.
    Sub(Key),
    /// A waiter node forwarding this node's progress to its own listeners.
    Node(Key),
    /// A pass-through edge forwarding into its combinator target.
    Pass(Key),
}

/// Chained-wait state: a node waiting on one previous promise, optionally
/// with further sequence steps to run as prior steps resolve.
pub(crate) struct WaitState {
    pub previous: Option<Key>,
    pub steps: VecDeque<SequenceStep>,
    /// Sequence semantics: every adopted previous compresses to one whole
    /// link regardless of its own depth. Plain chaining shares the previous
    /// chain's unit space instead.
    pub scaled: bool,
    /// Units banked from previouses already adopted, in this node's chain
    /// space.
    pub adopted: Fixed32,
    /// Units received from the current previous, in the previous chain's
    /// space.
    pub prev_units: Fixed32,
    /// Full span of the current previous, `(prev depth + 1)` wholes in
    /// fractional units.
    pub prev_full: u32,
    /// Units already forwarded to this node's listeners.
    pub sent: Fixed32,
    /// This node is linked as a progress listener down its chain; adopting a
    /// new previous must re-link.
    pub registered: bool,
}

/// All/Merge join state.
pub(crate) struct JoinState<V> {
    pub wait_count: u32,
    /// Per-input resolved values; an aggregate child contributes all of its
    /// values to its slot.
    pub results: Vec<Option<Vec<V>>>,
    pub passes: Vec<Key>,
    /// Expected total of all child chains, in fractional units.
    pub expected_units: f64,
    /// Sum of units received from children.
    pub current: Fixed32,
    /// Units already forwarded to this node's listeners (pre-scaled to the
    /// parent chain).
    pub out: Fixed32,
}

/// Race/First state. The two differ only in how failures settle the parent.
pub(crate) struct RaceState {
    pub wait_count: u32,
    pub passes: Vec<Key>,
    /// Max normalized child progress, pre-scaled to the parent chain. Never
    /// regresses.
    pub current: Fixed32,
}

pub(crate) enum Kind<V> {
    Leaf,
    Wait(WaitState),
    Join(JoinState<V>),
    Race(RaceState),
    First(RaceState),
}

pub(crate) struct Node<V, E> {
    pub state: State,
    pub retain: u32,
    /// Whole part = chain depth, frozen at creation. For leaves the fraction
    /// tracks reported progress within the current link.
    pub depth: Fixed32,
    pub kind: Kind<V>,
    pub outcome: Option<Outcome<V, E>>,
    pub dependents: SmallVec<[Dependent<V, E>; 2]>,
    pub progress: SmallVec<[ListenerRef; 2]>,
    /// Set once a completion listener consumes a terminal failure; an
    /// unobserved failure is reported when the node is disposed.
    pub observed: bool,
    /// The "alive until settled" seed retain has been given back.
    pub seed_released: bool,
}

impl<V, E> Node<V, E> {
    pub fn new(kind: Kind<V>, depth: Fixed32) -> Self {
        Self {
            state: State::Pending,
            retain: 1,
            depth,
            kind,
            outcome: None,
            dependents: SmallVec::new(),
            progress: SmallVec::new(),
            observed: false,
            seed_released: false,
        }
    }
}

/// One edge from a child promise into a combinator parent at a fixed input
/// index. Fires exactly once, releases its retain on the target, and returns
/// to the pass pool.
pub(crate) struct PassThrough {
    pub owner: Key,
    pub target: Key,
    pub index: u32,
    /// Units received from the owner chain so far.
    pub current: Fixed32,
    /// The owner chain's full contribution, `(owner depth + 1)` wholes in
    /// fractional units.
    pub owner_full: u32,
    pub registered: bool,
}

/// Host progress subscription. Pool-recycled like nodes and passes.
pub(crate) struct ProgressSub {
    /// Taken while the callback runs so user code never executes under the
    /// graph lock.
    pub callback: Option<ProgressCallback>,
    pub current: Fixed32,
    /// `owner depth + 1`, the normalization denominator in wholes.
    pub denominator: f64,
    /// Queued or mid-invocation; suppresses duplicate queue entries.
    pub handling: bool,
    /// Final `1.0` has been folded into the owner's resolve notification.
    pub done: bool,
}

/// Engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Recycle slots through free lists. Disabling only changes the
    /// allocation strategy, never observable behavior.
    pub pooling: bool,
    /// Fractional bits of the fixed-point progress counter, `1..=31`.
    pub progress_decimal_bits: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pooling: true,
            progress_decimal_bits: 13,
        }
    }
}
