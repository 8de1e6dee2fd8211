use std::collections::BTreeSet;

use fixedbitset::FixedBitSet;
use tracing::trace;

use crate::events::{Event, EventSet};

/// A coordinate-form matrix entry, used to bulk-build matrices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Triplet<T> {
    /// Row coordinate.
    pub row: usize,
    /// Column coordinate.
    pub col: usize,
    /// Entry value; duplicates at the same coordinate are merged at build time.
    pub value: T,
}

impl<T> Triplet<T> {
    /// Creates a triplet.
    pub fn new(row: usize, col: usize, value: T) -> Self {
        Self { row, col, value }
    }
}

/// A compressed sparse row matrix.
///
/// Rows keep their columns in ascending order and carry no explicit zeros,
/// so iteration over the neighbours of a state is always in ascending
/// destination order and `nnz` counts exactly the stored entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsMatrix<T> {
    rows: usize,
    cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<T>,
}

impl<T: Copy + Default> CsMatrix<T> {
    /// Creates a matrix of the given shape with no stored entries.
    pub fn zero(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            row_ptr: vec![0; rows + 1],
            col_idx: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Builds a matrix in canonical form from coordinate triplets, merging
    /// duplicate coordinates with `merge`.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        mut triplets: Vec<Triplet<T>>,
        merge: impl Fn(T, T) -> T,
    ) -> Self {
        triplets.sort_by_key(|t| (t.row, t.col));
        let mut entries: Vec<Triplet<T>> = Vec::with_capacity(triplets.len());
        for t in triplets {
            debug_assert!(t.row < rows && t.col < cols);
            match entries.last_mut() {
                Some(last) if last.row == t.row && last.col == t.col => {
                    last.value = merge(last.value, t.value);
                }
                _ => entries.push(t),
            }
        }

        let mut row_ptr = vec![0; rows + 1];
        for t in &entries {
            row_ptr[t.row + 1] += 1;
        }
        for r in 0..rows {
            row_ptr[r + 1] += row_ptr[r];
        }
        Self {
            rows,
            cols,
            row_ptr,
            col_idx: entries.iter().map(|t| t.col).collect(),
            values: entries.iter().map(|t| t.value).collect(),
        }
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    /// The entry at `(row, col)`, if one is stored.
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        let offset = self.col_idx[range.clone()].binary_search(&col).ok()?;
        Some(&self.values[range.start + offset])
    }

    /// Iterates over the stored entries of `row` as `(col, value)` pairs,
    /// columns ascending.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, &T)> + '_ {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        self.col_idx[range.clone()]
            .iter()
            .copied()
            .zip(&self.values[range])
    }

    /// Stores `value` at `(row, col)`, merging with an existing entry via
    /// `merge`. Keeps the matrix canonical; inserting shifts the tail of the
    /// storage, so bulk construction should go through [`Self::from_triplets`].
    pub fn insert_with(&mut self, row: usize, col: usize, value: T, merge: impl Fn(T, T) -> T) {
        debug_assert!(row < self.rows && col < self.cols);
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        match self.col_idx[range.clone()].binary_search(&col) {
            Ok(offset) => {
                let at = range.start + offset;
                self.values[at] = merge(self.values[at], value);
            }
            Err(offset) => {
                let at = range.start + offset;
                self.col_idx.insert(at, col);
                self.values.insert(at, value);
                for p in &mut self.row_ptr[row + 1..] {
                    *p += 1;
                }
            }
        }
    }

    /// Returns the transposed matrix, again in canonical form.
    pub fn transpose(&self) -> Self {
        let mut row_ptr = vec![0; self.cols + 1];
        for &j in &self.col_idx {
            row_ptr[j + 1] += 1;
        }
        for c in 0..self.cols {
            row_ptr[c + 1] += row_ptr[c];
        }

        let mut next = row_ptr.clone();
        let mut col_idx = vec![0; self.nnz()];
        let mut values = vec![T::default(); self.nnz()];
        for i in 0..self.rows {
            for (j, &v) in self.row(i) {
                let at = next[j];
                next[j] += 1;
                col_idx[at] = i;
                values[at] = v;
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            row_ptr,
            col_idx,
            values,
        }
    }
}

impl CsMatrix<EventSet> {
    /// Columns of `row` whose label contains `event`, ascending.
    pub fn cols_labelled(&self, row: usize, event: Event) -> impl Iterator<Item = usize> + '_ {
        self.row(row)
            .filter(move |(_, label)| label.contains(event))
            .map(|(col, _)| col)
    }
}

/// The boolean shadow of a labelled graph, preconditioned for reachability.
///
/// An entry at `(i, j)` means "state `j` steps to state `i`, or `j = i`":
/// the matrix is the transpose of the plain adjacency relation plus the
/// identity diagonal. With the identity folded in, iterating
/// `X ← BitGraph · X` never loses a lit state, so the stored-entry count of
/// the iterate grows monotonically and reaching a fixed point is detected by
/// comparing that count across iterations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitGraph {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl BitGraph {
    /// Creates the edgeless graph on `n` states (identity diagonal only).
    pub fn identity(n: usize) -> Self {
        Self {
            n,
            row_ptr: (0..=n).collect(),
            col_idx: (0..n).collect(),
        }
    }

    /// Builds a graph from `(destination, source)` pairs; the identity
    /// diagonal is added and duplicates are dropped.
    pub fn from_pairs(n: usize, mut pairs: Vec<(usize, usize)>) -> Self {
        pairs.extend((0..n).map(|d| (d, d)));
        pairs.sort_unstable();
        pairs.dedup();

        let mut row_ptr = vec![0; n + 1];
        for &(row, col) in &pairs {
            debug_assert!(row < n && col < n);
            row_ptr[row + 1] += 1;
        }
        for r in 0..n {
            row_ptr[r + 1] += row_ptr[r];
        }
        Self {
            n,
            row_ptr,
            col_idx: pairs.into_iter().map(|(_, col)| col).collect(),
        }
    }

    /// Number of states.
    pub fn len(&self) -> usize {
        self.n
    }

    /// Returns true if the graph has no states.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// The stored columns of `row`, ascending.
    pub fn row(&self, row: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[row]..self.row_ptr[row + 1]]
    }

    /// Returns true if an entry is stored at `(row, col)`.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.row(row).binary_search(&col).is_ok()
    }

    /// Stores an entry at `(row, col)` if not already present.
    pub fn insert(&mut self, row: usize, col: usize) {
        debug_assert!(row < self.n && col < self.n);
        let start = self.row_ptr[row];
        if let Err(offset) = self.row(row).binary_search(&col) {
            self.col_idx.insert(start + offset, col);
            for p in &mut self.row_ptr[row + 1..] {
                *p += 1;
            }
        }
    }

    /// Returns the transposed graph; the identity diagonal is preserved.
    pub fn transpose(&self) -> Self {
        let mut pairs = Vec::with_capacity(self.col_idx.len());
        for i in 0..self.n {
            for &j in self.row(i) {
                pairs.push((j, i));
            }
        }
        Self::from_pairs(self.n, pairs)
    }

    /// Breadth-first reachability as iterated boolean matrix product,
    /// batched over every seed at once.
    ///
    /// The iterate is kept state-major: entry `s` of the result holds one
    /// bit per seed column, lit iff `s` is reachable from that seed. The
    /// loop runs at most `n` passes and stops as soon as the total lit-bit
    /// count stalls.
    pub fn reach(&self, seeds: &[usize]) -> Vec<FixedBitSet> {
        let width = seeds.len();
        let mut x = vec![FixedBitSet::with_capacity(width); self.n];
        for (column, &seed) in seeds.iter().enumerate() {
            debug_assert!(seed < self.n);
            x[seed].insert(column);
        }

        let mut lit = 0;
        for pass in 0..self.n {
            let mut y = vec![FixedBitSet::with_capacity(width); self.n];
            for (i, yi) in y.iter_mut().enumerate() {
                for &j in self.row(i) {
                    yi.union_with(&x[j]);
                }
            }
            let now_lit: usize = y.iter().map(|b| b.count_ones(..)).sum();
            x = y;
            if now_lit == lit {
                trace!(passes = pass + 1, lit, "reachability fixed point");
                break;
            }
            lit = now_lit;
        }
        x
    }

    /// The union over all seeds of the states reachable from them.
    pub fn reach_states(&self, seeds: &[usize]) -> BTreeSet<usize> {
        self.reach(seeds)
            .iter()
            .enumerate()
            .filter(|(_, columns)| !columns.is_clear())
            .map(|(state, _)| state)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn union(a: EventSet, b: EventSet) -> EventSet {
        a | b
    }

    #[test]
    fn triplets_merge_and_sort() {
        let trips = vec![
            Triplet::new(1, 2, EventSet::from(0)),
            Triplet::new(0, 1, EventSet::from(1)),
            Triplet::new(1, 0, EventSet::from(2)),
            Triplet::new(1, 2, EventSet::from(3)),
        ];
        let m = CsMatrix::from_triplets(3, 3, trips, union);
        assert_eq!(m.nnz(), 3);
        assert_eq!(
            m.row(1).map(|(c, _)| c).collect_vec(),
            vec![0, 2],
            "columns must come out ascending"
        );
        assert_eq!(m.get(1, 2), Some(&EventSet::from_iter([0, 3])));
        assert_eq!(m.get(2, 2), None);
    }

    #[test]
    fn insert_keeps_canonical_form() {
        let mut m = CsMatrix::zero(2, 2);
        m.insert_with(0, 1, EventSet::from(4), union);
        m.insert_with(0, 0, EventSet::from(5), union);
        m.insert_with(0, 1, EventSet::from(6), union);
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.row(0).map(|(c, _)| c).collect_vec(), vec![0, 1]);
        assert_eq!(m.get(0, 1), Some(&EventSet::from_iter([4, 6])));
        assert_eq!(m.cols_labelled(0, 5).collect_vec(), vec![0]);
    }

    #[test]
    fn transpose_roundtrip() {
        let trips = vec![
            Triplet::new(0, 2, EventSet::from(0)),
            Triplet::new(2, 0, EventSet::from(1)),
            Triplet::new(2, 1, EventSet::from(2)),
        ];
        let m = CsMatrix::from_triplets(3, 3, trips, union);
        let t = m.transpose();
        assert_eq!(t.get(2, 0), Some(&EventSet::from(0)));
        assert_eq!(t.get(1, 2), Some(&EventSet::from(2)));
        assert_eq!(t.transpose(), m);
    }

    #[test]
    fn reach_follows_edges() {
        // 0 -> 1 -> 2, 3 isolated.
        let g = BitGraph::from_pairs(4, vec![(1, 0), (2, 1)]);
        assert_eq!(g.reach_states(&[0]).into_iter().collect_vec(), vec![0, 1, 2]);
        assert_eq!(g.reach_states(&[2]).into_iter().collect_vec(), vec![2]);
        assert_eq!(g.reach_states(&[3]).into_iter().collect_vec(), vec![3]);
        assert!(g.reach_states(&[]).is_empty());
    }

    #[test]
    fn reach_batches_seeds_independently() {
        // Two disjoint chains: 0 -> 1 and 2 -> 3.
        let g = BitGraph::from_pairs(4, vec![(1, 0), (3, 2)]);
        let columns = g.reach(&[0, 2]);
        assert!(columns[1].contains(0) && !columns[1].contains(1));
        assert!(columns[3].contains(1) && !columns[3].contains(0));
    }

    #[test]
    fn reach_handles_cycles() {
        let g = BitGraph::from_pairs(3, vec![(1, 0), (2, 1), (0, 2)]);
        assert_eq!(g.reach_states(&[1]).len(), 3);
    }

    #[test]
    fn transposed_graph_reverses_reachability() {
        let g = BitGraph::from_pairs(3, vec![(1, 0), (2, 1)]);
        let t = g.transpose();
        assert_eq!(t.reach_states(&[2]).into_iter().collect_vec(), vec![0, 1, 2]);
    }
}
