use tracing::debug;

use crate::events::{Event, EventSet};
use crate::math::Map;
use crate::sparse::{BitGraph, CsMatrix, Triplet};
use crate::system::{Automaton, Generator, State, StateSet};

/// The synchronous (parallel) composition of two systems, evaluated lazily.
///
/// No product matrix is ever stored: a pair state `(x, y)` is encoded as the
/// single index `y · states(lhs) + x`, and every transition query decodes
/// the pair and asks the operands. Shared events move both operands in
/// lockstep and are enabled only when both enable them; private events move
/// their owner and leave the other operand in place.
///
/// The product borrows its operands and must not outlive them; the operands
/// must not be mutated while the product observes them.
pub struct SyncProduct<'a> {
    lhs: &'a Automaton,
    rhs: &'a Automaton,
    states: usize,
    initial: State,
    marked: StateSet,
    events: EventSet,
    shared: EventSet,
    only_lhs: EventSet,
    only_rhs: EventSet,
    inv: Option<(CsMatrix<EventSet>, CsMatrix<EventSet>)>,
}

impl<'a> SyncProduct<'a> {
    /// Composes `lhs` and `rhs`. Both operands must have at least one state.
    pub fn new(lhs: &'a Automaton, rhs: &'a Automaton) -> Self {
        debug_assert!(lhs.states_len() > 0 && rhs.states_len() > 0);
        let shared = lhs.events() & rhs.events();
        let mut marked = StateSet::new();
        for &y in rhs.marked() {
            for &x in lhs.marked() {
                marked.insert(y * lhs.states_len() + x);
            }
        }
        Self {
            states: lhs.states_len() * rhs.states_len(),
            initial: rhs.initial() * lhs.states_len() + lhs.initial(),
            marked,
            events: lhs.events() | rhs.events(),
            shared,
            only_lhs: lhs.events() ^ shared,
            only_rhs: rhs.events() ^ shared,
            lhs,
            rhs,
            inv: None,
        }
    }

    /// Decodes a product state into its operand components.
    pub fn split(&self, q: State) -> (State, State) {
        (q % self.lhs.states_len(), q / self.lhs.states_len())
    }

    fn encode(&self, x: State, y: State) -> State {
        y * self.lhs.states_len() + x
    }

    /// Collects the product states reachable from the initial state, in
    /// ascending encoded order.
    pub fn reachable(&self) -> Vec<State> {
        let mut seen = StateSet::new();
        let mut stack = vec![self.initial];
        seen.insert(self.initial);
        while let Some(q) = stack.pop() {
            for event in self.events.iter() {
                if let Some(next) = self.trans(q, event) {
                    if seen.insert(next) {
                        stack.push(next);
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Materialises the reachable part of the product as a concrete system.
    pub fn materialize(&self) -> Automaton {
        let survivors = self.reachable();
        self.project(&survivors)
    }

    /// Projects a sorted set of surviving product states into a concrete
    /// system, renumbering them densely. Transitions whose target did not
    /// survive are dropped. If the initial state did not survive the result
    /// is the empty system.
    pub(crate) fn project(&self, survivors: &[State]) -> Automaton {
        debug_assert!(survivors.windows(2).all(|w| w[0] < w[1]));
        let rank: Map<State, usize> = survivors
            .iter()
            .enumerate()
            .map(|(rank, &q)| (q, rank))
            .collect();
        let Some(&initial) = rank.get(&self.initial) else {
            return Automaton::default();
        };

        let n = survivors.len();
        let mut triplets = Vec::new();
        let mut pairs = Vec::new();
        let mut forward = vec![EventSet::new(); n];
        let mut backward = vec![EventSet::new(); n];
        for (from, &q) in survivors.iter().enumerate() {
            for event in self.events.iter() {
                let Some(next) = self.trans(q, event) else {
                    continue;
                };
                let Some(&to) = rank.get(&next) else {
                    continue;
                };
                triplets.push(Triplet::new(from, to, EventSet::from(event)));
                pairs.push((to, from));
                forward[from].insert(event);
                backward[to].insert(event);
            }
        }

        let marked: StateSet = self
            .marked
            .iter()
            .filter_map(|q| rank.get(q).copied())
            .collect();
        debug!(
            states = n,
            transitions = triplets.len(),
            marked = marked.len(),
            "projected virtual states"
        );
        // The result keeps the whole product alphabet, not just the events
        // that survived: alphabet membership decides synchronisation in
        // later compositions.
        Automaton::from_parts(
            n,
            initial,
            marked,
            CsMatrix::from_triplets(n, n, triplets, |a, b| a | b),
            BitGraph::from_pairs(n, pairs),
            self.events,
            forward,
            backward,
        )
    }

    fn inv_component(
        graph: &CsMatrix<EventSet>,
        q: State,
        event: Event,
    ) -> impl Iterator<Item = State> + '_ {
        graph.cols_labelled(q, event)
    }
}

impl Generator for SyncProduct<'_> {
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
        if !self.events.contains(event) {
            return false;
        }
        let (x, y) = self.split(q);
        let in_lhs = self.lhs.contains_trans(x, event);
        let in_rhs = self.rhs.contains_trans(y, event);
        in_lhs && in_rhs
            || in_lhs && self.only_lhs.contains(event)
            || in_rhs && self.only_rhs.contains(event)
    }

    fn trans(&self, q: State, event: Event) -> Option<State> {
        if !self.events.contains(event) {
            return None;
        }
        let (x, y) = self.split(q);
        let in_lhs = self.lhs.contains_trans(x, event);
        let in_rhs = self.rhs.contains_trans(y, event);
        if in_lhs && in_rhs {
            Some(self.encode(self.lhs.trans(x, event)?, self.rhs.trans(y, event)?))
        } else if in_lhs && self.only_lhs.contains(event) {
            Some(self.encode(self.lhs.trans(x, event)?, y))
        } else if in_rhs && self.only_rhs.contains(event) {
            Some(self.encode(x, self.rhs.trans(y, event)?))
        } else {
            None
        }
    }

    fn contains_inv_trans(&self, q: State, event: Event) -> bool {
        if !self.events.contains(event) {
            return false;
        }
        let (x, y) = self.split(q);
        let in_lhs = self.lhs.contains_inv_trans(x, event);
        let in_rhs = self.rhs.contains_inv_trans(y, event);
        in_lhs && in_rhs
            || in_lhs && self.only_lhs.contains(event)
            || in_rhs && self.only_rhs.contains(event)
    }

    fn inv_trans(&self, q: State, event: Event) -> Vec<State> {
        let (inv_lhs, inv_rhs) = self
            .inv
            .as_ref()
            .expect("inverse lookups require allocate_inverted_graph to have been called");
        if !self.events.contains(event) {
            return Vec::new();
        }
        let (x, y) = self.split(q);
        let in_lhs = self.lhs.contains_inv_trans(x, event);
        let in_rhs = self.rhs.contains_inv_trans(y, event);
        if in_lhs && in_rhs {
            let from_rhs: Vec<State> = Self::inv_component(inv_rhs, y, event).collect();
            Self::inv_component(inv_lhs, x, event)
                .flat_map(|px| from_rhs.iter().map(move |&py| self.encode(px, py)))
                .collect()
        } else if in_lhs && self.only_lhs.contains(event) {
            Self::inv_component(inv_lhs, x, event)
                .map(|px| self.encode(px, y))
                .collect()
        } else if in_rhs && self.only_rhs.contains(event) {
            Self::inv_component(inv_rhs, y, event)
                .map(|py| self.encode(x, py))
                .collect()
        } else {
            Vec::new()
        }
    }

    fn allocate_inverted_graph(&mut self) {
        if self.inv.is_none() {
            self.inv = Some((self.lhs.transposed_graph(), self.rhs.transposed_graph()));
        }
    }

    fn clear_inverted_graph(&mut self) {
        self.inv = None;
    }

    fn is_virtual(&self) -> bool {
        true
    }
}

/// Synchronous composition, materialised: builds the reachable part of
/// `lhs ∥ rhs` as a concrete system.
pub fn synchronize(lhs: &Automaton, rhs: &Automaton) -> Automaton {
    if lhs.states_len() == 0 || rhs.states_len() == 0 {
        return Automaton::default();
    }
    SyncProduct::new(lhs, rhs).materialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{isomorphic, random_automaton};
    use rand::SeedableRng;

    const WORK: Event = 0;
    const HAND: Event = 1;
    const REST: Event = 2;

    /// 0 --WORK--> 1 --HAND--> 0, marked in 0.
    fn producer() -> Automaton {
        Automaton::builder(2)
            .marked([0])
            .transitions([(0, 1, WORK), (1, 0, HAND)])
            .build()
            .unwrap()
    }

    /// 0 --HAND--> 1 --REST--> 0, marked in 0.
    fn consumer() -> Automaton {
        Automaton::builder(2)
            .marked([0])
            .transitions([(0, 1, HAND), (1, 0, REST)])
            .build()
            .unwrap()
    }

    #[test]
    fn product_interleaves_private_and_synchronises_shared() {
        let p = producer();
        let c = consumer();
        let prod = SyncProduct::new(&p, &c);
        assert!(prod.is_virtual());
        assert_eq!(prod.states_len(), 4);
        assert_eq!(prod.initial(), 0);
        assert_eq!(prod.events(), EventSet::from_iter([WORK, HAND, REST]));

        // (0,0): only WORK is possible; HAND is shared and the producer
        // cannot offer it yet.
        assert_eq!(prod.trans(0, WORK), Some(1));
        assert_eq!(prod.trans(0, HAND), None);
        assert_eq!(prod.trans(0, REST), None);
        // (1,0): HAND moves both operands at once.
        assert!(prod.contains_trans(1, HAND));
        assert_eq!(prod.trans(1, HAND), Some(2));
        // (0,1): REST is private to the consumer.
        assert_eq!(prod.trans(2, REST), Some(0));
        assert_eq!(prod.marked(), &StateSet::from_iter([0]));
    }

    #[test]
    fn product_inverse_transitions() {
        let p = producer();
        let c = consumer();
        let mut prod = SyncProduct::new(&p, &c);
        prod.allocate_inverted_graph();
        assert!(prod.contains_inv_trans(2, HAND));
        assert_eq!(prod.inv_trans(2, HAND), vec![1]);
        assert_eq!(prod.inv_trans(0, REST), vec![2]);
        assert_eq!(prod.inv_trans(0, HAND), Vec::<State>::new());
        prod.clear_inverted_graph();
    }

    #[test]
    #[should_panic(expected = "allocate_inverted_graph")]
    fn product_inverse_lookup_needs_allocation() {
        let p = producer();
        let c = consumer();
        let prod = SyncProduct::new(&p, &c);
        let _ = prod.inv_trans(0, HAND);
    }

    #[test]
    fn synchronize_materialises_the_product() {
        let p = producer();
        let c = consumer();
        let sys = synchronize(&p, &c);
        sys.check_consistency();
        assert_eq!(sys.states_len(), 4);
        assert_eq!(sys.transition_count(), 5);
        assert_eq!(sys.marked(), &StateSet::from_iter([0]));
        assert_eq!(sys.trans(0, WORK), Some(1));
        assert_eq!(sys.trans(1, HAND), Some(2));
        assert_eq!(sys.trans(2, REST), Some(0));
        assert_eq!(sys.trans(2, WORK), Some(3));
        assert_eq!(sys.trans(3, REST), Some(1));
    }

    #[test]
    fn synchronize_skips_unreachable_pair_states() {
        // Both operands move on HAND only, so the mixed pairs (0,1) and
        // (1,0) can never be entered.
        let a = Automaton::builder(2)
            .marked([1])
            .transition(0, 1, HAND)
            .build()
            .unwrap();
        let b = Automaton::builder(2)
            .marked([1])
            .transition(0, 1, HAND)
            .build()
            .unwrap();
        let sys = synchronize(&a, &b);
        sys.check_consistency();
        assert_eq!(sys.states_len(), 2);
        assert_eq!(sys.transition_count(), 1);
        assert_eq!(sys.marked(), &StateSet::from_iter([1]));
    }

    #[test]
    fn synchronize_with_disjoint_alphabets_is_a_shuffle() {
        let a = Automaton::builder(2)
            .marked([0])
            .transitions([(0, 1, WORK), (1, 0, HAND)])
            .build()
            .unwrap();
        let b = Automaton::builder(2)
            .marked([0])
            .transitions([(0, 1, 10), (1, 0, 11)])
            .build()
            .unwrap();
        let sys = synchronize(&a, &b);
        sys.check_consistency();
        assert_eq!(sys.states_len(), 4);
        assert_eq!(sys.transition_count(), 8);
    }

    #[test]
    fn synchronize_is_commutative_up_to_renaming() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let a = random_automaton(&mut rng, 4, &[0, 1, 2]);
            let b = random_automaton(&mut rng, 3, &[1, 2, 3]);
            assert!(isomorphic(&synchronize(&a, &b), &synchronize(&b, &a)));
        }
    }

    #[test]
    fn synchronize_is_associative_up_to_renaming() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(13);
        for _ in 0..20 {
            let a = random_automaton(&mut rng, 3, &[0, 1]);
            let b = random_automaton(&mut rng, 3, &[1, 2]);
            let c = random_automaton(&mut rng, 3, &[0, 2, 3]);
            let left = synchronize(&synchronize(&a, &b), &c);
            let right = synchronize(&a, &synchronize(&b, &c));
            assert!(isomorphic(&left, &right));
        }
    }

    #[test]
    fn synchronize_with_an_empty_operand_is_empty() {
        let sys = synchronize(&Automaton::default(), &producer());
        assert_eq!(sys.states_len(), 0);
    }
}
