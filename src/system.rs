use std::collections::BTreeSet;

use itertools::Itertools;
use thiserror::Error;
use tracing::debug;

use crate::events::{Event, EventSet};
use crate::sparse::{BitGraph, CsMatrix, Triplet};

/// A state index. States are dense indices in `[0, states_len)`; they are
/// renumbered only by explicit structural operations (trim, projection of a
/// product).
pub type State = usize;

/// An ordered set of states. Results of the structural reductions are
/// ordered so that identical inputs yield identical outputs, bit for bit.
pub type StateSet = BTreeSet<State>;

/// The query surface shared by every system, concrete or lazy.
///
/// [`Automaton`] implements it by reading its sparse matrices;
/// [`SyncProduct`](crate::ops::SyncProduct) implements it by combining the
/// answers of its two operands on the fly. Code that only asks questions
/// (the supervisor search, reachability walks, tests) is written against
/// this trait and never cares which of the two it got.
pub trait Generator {
    /// Number of states.
    fn states_len(&self) -> usize;

    /// The initial state.
    fn initial(&self) -> State;

    /// The marked (accepting) states.
    fn marked(&self) -> &StateSet;

    /// The event alphabet of the system.
    fn events(&self) -> EventSet;

    /// Returns true if some transition leaves `q` on `event`. O(1), answered
    /// from the per-state forward summary.
    fn contains_trans(&self, q: State, event: Event) -> bool;

    /// The successor of `q` under `event`. Systems are deterministic per
    /// event, so there is at most one.
    fn trans(&self, q: State, event: Event) -> Option<State>;

    /// Returns true if some transition enters `q` on `event`. O(1), answered
    /// from the per-state inverse summary.
    fn contains_inv_trans(&self, q: State, event: Event) -> bool;

    /// All predecessors of `q` under `event`, ascending.
    ///
    /// Requires the inverse graph to be allocated; calling this outside an
    /// [`allocate_inverted_graph`](Self::allocate_inverted_graph) /
    /// [`clear_inverted_graph`](Self::clear_inverted_graph) scope is a
    /// contract violation and panics.
    fn inv_trans(&self, q: State, event: Event) -> Vec<State>;

    /// Materialises the transposed transition graph backing
    /// [`inv_trans`](Self::inv_trans). Idempotent. The system must not be
    /// mutated until the matching [`clear_inverted_graph`](Self::clear_inverted_graph).
    fn allocate_inverted_graph(&mut self);

    /// Releases the transposed transition graph. Idempotent.
    fn clear_inverted_graph(&mut self);

    /// Whether transition queries are answered lazily from operands rather
    /// than from stored matrices.
    fn is_virtual(&self) -> bool;
}

/// A concrete discrete event system: a finite automaton stored as a pair of
/// sparse adjacency matrices over the event alphabet.
///
/// The labelled matrix carries an [`EventSet`] per edge and answers
/// transition lookups; the boolean shadow graph is stored transposed with an
/// identity diagonal and feeds the reachability kernel. The two are kept
/// consistent by every public operation: an edge has a label iff it has a
/// shadow bit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Automaton {
    states: usize,
    initial: State,
    marked: StateSet,
    graph: CsMatrix<EventSet>,
    bit_graph: BitGraph,
    events: EventSet,
    forward: Vec<EventSet>,
    backward: Vec<EventSet>,
    inv_graph: Option<CsMatrix<EventSet>>,
}

impl Default for Automaton {
    fn default() -> Self {
        Self::new(0, 0, [])
    }
}

impl Automaton {
    /// Creates a system with `states` states, initial state `initial`, the
    /// given marked states and no transitions.
    pub fn new(states: usize, initial: State, marked: impl IntoIterator<Item = State>) -> Self {
        debug_assert!(initial < states || states == 0);
        let marked: StateSet = marked.into_iter().collect();
        debug_assert!(marked.iter().all(|&m| m < states));
        Self {
            states,
            initial,
            marked,
            graph: CsMatrix::zero(states, states),
            bit_graph: BitGraph::identity(states),
            events: EventSet::new(),
            forward: vec![EventSet::new(); states],
            backward: vec![EventSet::new(); states],
            inv_graph: None,
        }
    }

    /// Starts a validated construction of a system with `states` states.
    pub fn builder(states: usize) -> AutomatonBuilder {
        AutomatonBuilder {
            states,
            initial: 0,
            marked: Vec::new(),
            transitions: Vec::new(),
            alphabet: EventSet::new(),
        }
    }

    /// Adds `event` to the label of the edge `from → to`. Idempotent when
    /// the event is already on the edge. Updates the shadow graph, the
    /// alphabet and both per-state summaries.
    pub fn set_transition(&mut self, from: State, to: State, event: Event) {
        debug_assert!(from < self.states && to < self.states);
        debug_assert!(
            self.inv_graph.is_none(),
            "must not mutate the system while the inverted graph is allocated"
        );
        self.graph
            .insert_with(from, to, EventSet::from(event), |a, b| a | b);
        self.bit_graph.insert(to, from);
        self.events.insert(event);
        self.forward[from].insert(event);
        self.backward[to].insert(event);
    }

    /// The label of the edge `from → to`; empty if there is no edge.
    pub fn label(&self, from: State, to: State) -> EventSet {
        self.graph.get(from, to).copied().unwrap_or_default()
    }

    /// Widens the declared alphabet beyond the union of the labels.
    ///
    /// A system may share events with a composition partner without using
    /// them in any transition of its own; such events still synchronise, and
    /// a specification that stays silent on a shared event thereby disables
    /// it in the product.
    pub fn insert_events(&mut self, events: EventSet) {
        self.events |= events;
    }

    /// The events leaving `q`, as one set.
    pub fn state_events(&self, q: State) -> EventSet {
        self.forward[q]
    }

    /// The events entering `q`, as one set.
    pub fn inv_state_events(&self, q: State) -> EventSet {
        self.backward[q]
    }

    /// Number of stored edge labels. Counts a multi-event edge once.
    pub fn transition_count(&self) -> usize {
        self.graph.nnz()
    }

    /// The states reachable from the initial state.
    pub fn accessible_part(&self) -> StateSet {
        if self.states == 0 {
            return StateSet::new();
        }
        self.bit_graph.reach_states(&[self.initial])
    }

    /// The states from which some marked state is reachable.
    pub fn coaccessible_part(&self) -> StateSet {
        let seeds = self.marked.iter().copied().collect_vec();
        self.bit_graph.transpose().reach_states(&seeds)
    }

    /// The accessible and coaccessible states.
    pub fn trim_states(&self) -> StateSet {
        let accessible = self.accessible_part();
        self.coaccessible_part()
            .into_iter()
            .filter(|q| accessible.contains(q))
            .collect()
    }

    /// Shrinks the system to its trim states, renumbering them densely in
    /// ascending old-index order. A system that is already trim is left
    /// untouched. If no state is both accessible and coaccessible the result
    /// is the empty system.
    pub fn trim(&mut self) -> &mut Self {
        let keep = self.trim_states();
        if keep.len() == self.states {
            return self;
        }
        debug!(states = self.states, kept = keep.len(), "trimming system");

        let mut renumber: Vec<Option<usize>> = vec![None; self.states];
        for (new, &old) in keep.iter().enumerate() {
            renumber[old] = Some(new);
        }

        let n = keep.len();
        let mut triplets = Vec::new();
        let mut pairs = Vec::new();
        let mut forward = vec![EventSet::new(); n];
        let mut backward = vec![EventSet::new(); n];
        let mut events = EventSet::new();
        for (new_from, &old_from) in keep.iter().enumerate() {
            for (old_to, &label) in self.graph.row(old_from) {
                let Some(new_to) = renumber[old_to] else {
                    continue;
                };
                triplets.push(Triplet::new(new_from, new_to, label));
                pairs.push((new_to, new_from));
                forward[new_from] |= label;
                backward[new_to] |= label;
                events |= label;
            }
        }

        self.graph = CsMatrix::from_triplets(n, n, triplets, |a, b| a | b);
        self.bit_graph = BitGraph::from_pairs(n, pairs);
        self.marked = self.marked.iter().filter_map(|&m| renumber[m]).collect();
        // The initial state survives whenever any state does.
        self.initial = if n > 0 { renumber[self.initial].unwrap_or(0) } else { 0 };
        self.states = n;
        self.events = events;
        self.forward = forward;
        self.backward = backward;
        self.inv_graph = None;
        self
    }

    /// Reserved for accelerator offload of the shadow graph; currently a no-op.
    pub fn allocate_device_cache(&mut self) {}

    /// Reserved for accelerator offload of the shadow graph; currently a no-op.
    pub fn clear_device_cache(&mut self) {}

    pub(crate) fn transposed_graph(&self) -> CsMatrix<EventSet> {
        self.graph.transpose()
    }

    pub(crate) fn from_parts(
        states: usize,
        initial: State,
        marked: StateSet,
        graph: CsMatrix<EventSet>,
        bit_graph: BitGraph,
        events: EventSet,
        forward: Vec<EventSet>,
        backward: Vec<EventSet>,
    ) -> Self {
        Self {
            states,
            initial,
            marked,
            graph,
            bit_graph,
            events,
            forward,
            backward,
            inv_graph: None,
        }
    }

    /// Checks every structural invariant tying the matrices, the summaries
    /// and the alphabet together. Test support.
    #[cfg(test)]
    pub(crate) fn check_consistency(&self) {
        assert!(self.initial < self.states || self.states == 0);
        assert!(self.marked.iter().all(|&m| m < self.states));
        assert_eq!(self.forward.len(), self.states);
        assert_eq!(self.backward.len(), self.states);

        let mut forward = vec![EventSet::new(); self.states];
        let mut backward = vec![EventSet::new(); self.states];
        let mut events = EventSet::new();
        for from in 0..self.states {
            for (to, &label) in self.graph.row(from) {
                assert!(label.any(), "stored label must be non-empty");
                assert!(
                    self.bit_graph.contains(to, from),
                    "label at ({from}, {to}) lacks its shadow bit"
                );
                forward[from] |= label;
                backward[to] |= label;
                events |= label;
            }
        }
        for to in 0..self.states {
            for &from in self.bit_graph.row(to) {
                assert!(
                    from == to || self.label(from, to).any(),
                    "shadow bit at ({from}, {to}) lacks a label"
                );
            }
        }
        assert_eq!(forward, self.forward);
        assert_eq!(backward, self.backward);
        assert!(
            self.events.contains_all(events),
            "alphabet must cover every label"
        );
    }
}

impl Generator for Automaton {
    fn states_len(&self) -> usize {
        self.states
    }

    fn initial(&self) -> State {
        self.initial
    }

    fn marked(&self) -> &StateSet {
        &self.marked
    }

    fn events(&self) -> EventSet {
        self.events
    }

    fn contains_trans(&self, q: State, event: Event) -> bool {
        self.forward[q].contains(event)
    }

    fn trans(&self, q: State, event: Event) -> Option<State> {
        if !self.forward[q].contains(event) {
            return None;
        }
        self.graph.cols_labelled(q, event).next()
    }

    fn contains_inv_trans(&self, q: State, event: Event) -> bool {
        self.backward[q].contains(event)
    }

    fn inv_trans(&self, q: State, event: Event) -> Vec<State> {
        let inv = self
            .inv_graph
            .as_ref()
            .expect("inverse lookups require allocate_inverted_graph to have been called");
        if !self.backward[q].contains(event) {
            return Vec::new();
        }
        inv.cols_labelled(q, event).collect()
    }

    fn allocate_inverted_graph(&mut self) {
        if self.inv_graph.is_none() {
            self.inv_graph = Some(self.graph.transpose());
        }
    }

    fn clear_inverted_graph(&mut self) {
        self.inv_graph = None;
    }

    fn is_virtual(&self) -> bool {
        false
    }
}

/// Validated construction of an [`Automaton`] from an edge list.
#[derive(Clone, Debug, Default)]
pub struct AutomatonBuilder {
    states: usize,
    initial: State,
    marked: Vec<State>,
    transitions: Vec<(State, State, Event)>,
    alphabet: EventSet,
}

/// The ways a transition table can fail to describe a system.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BuildError {
    /// The initial state lies outside the state range.
    #[error("initial state {initial} out of range for {states} states")]
    InitialState {
        /// Offending initial state.
        initial: State,
        /// Declared number of states.
        states: usize,
    },
    /// A marked state lies outside the state range.
    #[error("marked state {marked} out of range for {states} states")]
    MarkedState {
        /// Offending marked state.
        marked: State,
        /// Declared number of states.
        states: usize,
    },
    /// A transition endpoint lies outside the state range.
    #[error("transition endpoint {state} out of range for {states} states")]
    TransitionEndpoint {
        /// Offending endpoint.
        state: State,
        /// Declared number of states.
        states: usize,
    },
}

impl AutomatonBuilder {
    /// Sets the initial state; defaults to `0`.
    pub fn initial(mut self, initial: State) -> Self {
        self.initial = initial;
        self
    }

    /// Marks the given states.
    pub fn marked(mut self, marked: impl IntoIterator<Item = State>) -> Self {
        self.marked.extend(marked);
        self
    }

    /// Adds one transition `from → to` on `event`.
    pub fn transition(mut self, from: State, to: State, event: Event) -> Self {
        self.transitions.push((from, to, event));
        self
    }

    /// Adds a batch of `(from, to, event)` transitions.
    pub fn transitions(
        mut self,
        transitions: impl IntoIterator<Item = (State, State, Event)>,
    ) -> Self {
        self.transitions.extend(transitions);
        self
    }

    /// Declares alphabet events beyond those appearing on transitions.
    pub fn alphabet(mut self, events: EventSet) -> Self {
        self.alphabet |= events;
        self
    }

    /// Validates the accumulated description and builds the system.
    pub fn build(self) -> Result<Automaton, BuildError> {
        let states = self.states;
        if self.initial >= states && states > 0 || states == 0 && self.initial > 0 {
            return Err(BuildError::InitialState {
                initial: self.initial,
                states,
            });
        }
        if let Some(&marked) = self.marked.iter().find(|&&m| m >= states) {
            return Err(BuildError::MarkedState { marked, states });
        }
        if let Some(&state) = self
            .transitions
            .iter()
            .flat_map(|(from, to, _)| [from, to])
            .find(|&&q| q >= states)
        {
            return Err(BuildError::TransitionEndpoint { state, states });
        }

        let mut automaton = Automaton::new(states, self.initial, self.marked);
        for (from, to, event) in self.transitions {
            automaton.set_transition(from, to, event);
        }
        automaton.insert_events(self.alphabet);
        Ok(automaton)
    }
}

/// Builds a random per-event-deterministic system for property tests. Test
/// support; seeded by the caller.
#[cfg(test)]
pub(crate) fn random_automaton(
    rng: &mut rand::rngs::StdRng,
    states: usize,
    alphabet: &[Event],
) -> Automaton {
    use rand::Rng;

    let marked = (0..states).filter(|_| rng.gen_bool(0.4)).collect_vec();
    let marked = if marked.is_empty() {
        vec![rng.gen_range(0..states)]
    } else {
        marked
    };
    let mut automaton = Automaton::new(states, 0, marked);
    for q in 0..states {
        for &event in alphabet {
            if rng.gen_bool(0.5) {
                automaton.set_transition(q, rng.gen_range(0..states), event);
            }
        }
    }
    automaton
}

/// Structural isomorphism up to state renaming, decided by a paired forward
/// walk from the initial states. Sound for per-event-deterministic systems
/// whose states are all accessible. Test support.
#[cfg(test)]
pub(crate) fn isomorphic(lhs: &Automaton, rhs: &Automaton) -> bool {
    use crate::math::Map;

    if lhs.states_len() != rhs.states_len()
        || lhs.transition_count() != rhs.transition_count()
        || lhs.marked().len() != rhs.marked().len()
        || lhs.events() != rhs.events()
    {
        return false;
    }
    if lhs.states_len() == 0 {
        return true;
    }

    let mut forward: Map<State, State> = Map::default();
    let mut backward: Map<State, State> = Map::default();
    forward.insert(lhs.initial(), rhs.initial());
    backward.insert(rhs.initial(), lhs.initial());
    let mut stack = vec![(lhs.initial(), rhs.initial())];
    while let Some((x, y)) = stack.pop() {
        if lhs.state_events(x) != rhs.state_events(y)
            || lhs.marked().contains(&x) != rhs.marked().contains(&y)
        {
            return false;
        }
        for event in lhs.state_events(x).iter() {
            let nx = lhs.trans(x, event).unwrap();
            let ny = rhs.trans(y, event).unwrap();
            match (forward.get(&nx), backward.get(&ny)) {
                (Some(&mapped), _) if mapped != ny => return false,
                (_, Some(&mapped)) if mapped != nx => return false,
                (None, None) => {
                    forward.insert(nx, ny);
                    backward.insert(ny, nx);
                    stack.push((nx, ny));
                }
                _ => {}
            }
        }
    }
    forward.len() == lhs.states_len()
}
