use itertools::Itertools;
use tracing::debug;

use crate::events::EventSet;
use crate::math::Set;
use crate::ops::SyncProduct;
use crate::system::{Automaton, Generator, State};

/// Monolithic supervisor synthesis: the supremal controllable sublanguage of
/// the specification `spec` with respect to the plant `plant`, under the
/// given uncontrollable events.
///
/// The synthesis explores the lazy product `plant ∥ spec` forward from its
/// initial state. A product state is bad when the plant offers an
/// uncontrollable event there that the product disables — a supervisor
/// realising the specification would have to disable an event it is not
/// allowed to. Bad states are discarded together with every state that can
/// reach them through uncontrollable events alone, since disabling the
/// connecting events is equally forbidden. The surviving states are then
/// restricted to those that can still reach a marked state, and projected
/// into a concrete system.
///
/// Events outside the plant alphabet cannot be offered by the plant and are
/// ignored as uncontrollable.
pub fn supervisor_synthesis(
    plant: &Automaton,
    spec: &Automaton,
    uncontrollable: EventSet,
) -> Automaton {
    if plant.states_len() == 0 || spec.states_len() == 0 {
        return Automaton::default();
    }
    let uncontrollable = uncontrollable & plant.events();
    let mut product = SyncProduct::new(plant, spec);
    product.allocate_inverted_graph();

    // Phase 1: forward discovery, pruning bad states as they surface.
    let mut kept: Set<State> = Set::default();
    let mut removed: Set<State> = Set::default();
    let mut frontier = vec![product.initial()];
    while let Some(q) = frontier.pop() {
        if removed.contains(&q) || kept.contains(&q) {
            continue;
        }
        let (x, _) = product.split(q);
        let bad = uncontrollable
            .iter()
            .any(|event| plant.contains_trans(x, event) && product.trans(q, event).is_none());
        if bad {
            remove_bad_states(&product, q, uncontrollable, &mut kept, &mut removed);
            continue;
        }
        kept.insert(q);
        for event in product.events().iter() {
            if let Some(next) = product.trans(q, event) {
                if !removed.contains(&next) && !kept.contains(&next) {
                    frontier.push(next);
                }
            }
        }
    }
    debug!(kept = kept.len(), removed = removed.len(), "bad-state search done");

    // Phase 2: keep only states that still reach a marked state within the
    // surviving relation.
    let mut coreachable: Set<State> = product
        .marked()
        .iter()
        .copied()
        .filter(|q| kept.contains(q))
        .collect();
    let mut frontier = coreachable.iter().copied().collect_vec();
    while let Some(q) = frontier.pop() {
        for event in product.events().iter() {
            for prev in product.inv_trans(q, event) {
                if kept.contains(&prev) && coreachable.insert(prev) {
                    frontier.push(prev);
                }
            }
        }
    }
    debug!(
        coreachable = coreachable.len(),
        blocking = kept.len() - coreachable.len(),
        "co-reachability trim done"
    );

    product.clear_inverted_graph();
    let survivors = coreachable.into_iter().sorted().collect_vec();
    product.project(&survivors)
}

/// Backward closure of a bad state over the uncontrollable events: every
/// state with an uncontrollable path into `seed` is bad too, and is moved
/// out of the kept set.
fn remove_bad_states(
    product: &SyncProduct<'_>,
    seed: State,
    uncontrollable: EventSet,
    kept: &mut Set<State>,
    removed: &mut Set<State>,
) {
    let mut stack = vec![seed];
    removed.insert(seed);
    kept.remove(&seed);
    while let Some(q) = stack.pop() {
        for event in uncontrollable.iter() {
            for prev in product.inv_trans(q, event) {
                if removed.insert(prev) {
                    kept.remove(&prev);
                    stack.push(prev);
                }
            }
        }
    }
}
