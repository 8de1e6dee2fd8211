#![doc = include_str!("../README.md")]

/// Hashing-related type aliases used throughout the crate.
pub mod math;

/// Events and fixed-width event sets, the scalars of the label matrices.
pub mod events;

/// Compressed sparse row matrices and the boolean reachability kernel.
pub mod sparse;

/// Concrete automata and the shared query surface of all systems.
pub mod system;

/// Operations combining systems: synchronous product and supervisor synthesis.
pub mod ops;

pub use events::{Event, EventSet};
pub use ops::{supervisor_synthesis, synchronize, SyncProduct};
pub use system::{Automaton, AutomatonBuilder, BuildError, Generator, State, StateSet};

/// Everything needed to model and compose systems: `use supremal::prelude::*;`.
pub mod prelude {
    pub use crate::events::{Event, EventSet};
    pub use crate::ops::{supervisor_synthesis, synchronize, SyncProduct};
    pub use crate::system::{Automaton, Generator, State, StateSet};
}
