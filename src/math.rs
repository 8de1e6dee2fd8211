/// Type alias for sets, hides which hasher the crate settled on.
pub type Set<S> = fxhash::FxHashSet<S>;
/// Type alias for maps, hides which hasher the crate settled on.
pub type Map<K, V> = fxhash::FxHashMap<K, V>;
