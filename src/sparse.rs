use core::fmt;
use core::ops::Range;

use faer_core::sparse::mul::{dense_sparse_matmul, sparse_dense_matmul};
use faer_core::sparse::{SparseColMatRef, SymbolicSparseColMatRef};
use faer_core::{mat, ComplexField, Parallelism, SimpleEntity};

use crate::operator::LinearOperator;

/// Column-compressed sparsity pattern.
///
/// Indices are zero-based; each column's row indices must be strictly increasing.
#[derive(Debug, Clone)]
pub struct SparsityPattern {
    nrows: usize,
    ncols: usize,
    col_ptrs: Vec<usize>,
    row_indices: Vec<usize>,
}

/// Validation errors for a [`SparsityPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// col_ptrs length is not ncols + 1.
    ColPtrLen { expected: usize, actual: usize },
    /// col_ptrs[0] is not 0.
    ColPtrStart { value: usize },
    /// col_ptrs decreases between two columns.
    ColPtrNotMonotonic { col: usize, prev: usize, next: usize },
    /// col_ptrs[ncols] does not match the number of row indices.
    ColPtrEnd { last: usize, nnz: usize },
    /// A row index is >= nrows.
    RowIndexOutOfBounds { col: usize, row: usize, nrows: usize },
    /// Row indices in a column are not strictly increasing.
    RowIndexNotSorted { col: usize, prev: usize, next: usize },
    /// A triplet column index is >= ncols.
    ColIndexOutOfBounds { col: usize, ncols: usize },
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColPtrLen { expected, actual } => {
                write!(f, "col_ptrs length {actual} does not match expected {expected}")
            }
            Self::ColPtrStart { value } => write!(f, "col_ptrs must start at 0 (got {value})"),
            Self::ColPtrNotMonotonic { col, prev, next } => {
                write!(f, "col_ptrs not monotonic at col {col}: {prev} > {next}")
            }
            Self::ColPtrEnd { last, nnz } => {
                write!(f, "col_ptrs ends at {last} but there are {nnz} row indices")
            }
            Self::RowIndexOutOfBounds { col, row, nrows } => {
                write!(f, "row index {row} in col {col} exceeds nrows {nrows}")
            }
            Self::RowIndexNotSorted { col, prev, next } => {
                write!(f, "row indices not sorted in col {col}: {prev} >= {next}")
            }
            Self::ColIndexOutOfBounds { col, ncols } => {
                write!(f, "col index {col} exceeds ncols {ncols}")
            }
        }
    }
}

impl std::error::Error for PatternError {}

/// Errors while assembling a [`CscOperator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparseError {
    /// The sparsity pattern is invalid.
    Pattern(PatternError),
    /// values.len() differs from the pattern's nnz.
    ValuesLength { expected: usize, actual: usize },
}

impl fmt::Display for SparseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern(err) => write!(f, "invalid sparsity pattern: {err}"),
            Self::ValuesLength { expected, actual } => {
                write!(f, "values length {actual} does not match nnz {expected}")
            }
        }
    }
}

impl std::error::Error for SparseError {}

impl From<PatternError> for SparseError {
    fn from(err: PatternError) -> Self {
        Self::Pattern(err)
    }
}

impl SparsityPattern {
    /// Creates a validated column-compressed pattern.
    ///
    /// Requirements:
    /// - `col_ptrs.len() == ncols + 1`, starting at `0`, non-decreasing
    /// - `col_ptrs[ncols] == row_indices.len()`
    /// - within a column, row indices are strictly increasing and `< nrows`
    pub fn new(
        nrows: usize,
        ncols: usize,
        col_ptrs: Vec<usize>,
        row_indices: Vec<usize>,
    ) -> Result<Self, PatternError> {
        if col_ptrs.len() != ncols + 1 {
            return Err(PatternError::ColPtrLen {
                expected: ncols + 1,
                actual: col_ptrs.len(),
            });
        }
        if col_ptrs[0] != 0 {
            return Err(PatternError::ColPtrStart { value: col_ptrs[0] });
        }
        if let Some((col, w)) = col_ptrs
            .windows(2)
            .enumerate()
            .find(|(_, w)| w[0] > w[1])
        {
            return Err(PatternError::ColPtrNotMonotonic {
                col,
                prev: w[0],
                next: w[1],
            });
        }
        if col_ptrs[ncols] != row_indices.len() {
            return Err(PatternError::ColPtrEnd {
                last: col_ptrs[ncols],
                nnz: row_indices.len(),
            });
        }

        for col in 0..ncols {
            let rows = &row_indices[col_ptrs[col]..col_ptrs[col + 1]];
            if let Some(&row) = rows.iter().find(|&&row| row >= nrows) {
                return Err(PatternError::RowIndexOutOfBounds { col, row, nrows });
            }
            if let Some(w) = rows.windows(2).find(|w| w[0] >= w[1]) {
                return Err(PatternError::RowIndexNotSorted {
                    col,
                    prev: w[0],
                    next: w[1],
                });
            }
        }

        Ok(Self {
            nrows,
            ncols,
            col_ptrs,
            row_indices,
        })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.row_indices.len()
    }

    pub fn col_ptrs(&self) -> &[usize] {
        &self.col_ptrs
    }

    pub fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }

    /// Index range into `row_indices` for the given column.
    pub fn col_range(&self, col: usize) -> Range<usize> {
        self.col_ptrs[col]..self.col_ptrs[col + 1]
    }

    pub fn row_indices_of_col(&self, col: usize) -> &[usize] {
        &self.row_indices[self.col_range(col)]
    }

    /// faer view of the pattern.
    pub fn as_symbolic(&self) -> SymbolicSparseColMatRef<'_, usize> {
        // SAFETY: `new` checked monotone column pointers and sorted, in-bounds row indices.
        unsafe {
            SymbolicSparseColMatRef::new_unchecked(
                self.nrows,
                self.ncols,
                &self.col_ptrs,
                None,
                &self.row_indices,
            )
        }
    }
}

/// Sparse matrix in compressed sparse column form, used as a [`LinearOperator`].
#[derive(Debug, Clone)]
pub struct CscOperator<E: ComplexField> {
    pattern: SparsityPattern,
    values: Vec<E>,
}

impl<E: ComplexField> CscOperator<E> {
    /// Pairs a validated pattern with one value per stored entry.
    pub fn new(pattern: SparsityPattern, values: Vec<E>) -> Result<Self, SparseError> {
        if values.len() != pattern.nnz() {
            return Err(SparseError::ValuesLength {
                expected: pattern.nnz(),
                actual: values.len(),
            });
        }
        Ok(Self { pattern, values })
    }

    /// Assembles a matrix from zero-based `(row, col, value)` triplets.
    ///
    /// Duplicate entries are summed.
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, E)],
    ) -> Result<Self, SparseError> {
        let mut cols: Vec<Vec<(usize, E)>> = vec![Vec::new(); ncols];
        for &(row, col, value) in triplets {
            if col >= ncols {
                return Err(PatternError::ColIndexOutOfBounds { col, ncols }.into());
            }
            if row >= nrows {
                return Err(PatternError::RowIndexOutOfBounds { col, row, nrows }.into());
            }
            cols[col].push((row, value));
        }

        let mut col_ptrs = Vec::with_capacity(ncols + 1);
        let mut row_indices = Vec::with_capacity(triplets.len());
        let mut values: Vec<E> = Vec::with_capacity(triplets.len());
        col_ptrs.push(0);
        for mut entries in cols {
            entries.sort_by_key(|&(row, _)| row);
            let start = row_indices.len();
            for (row, value) in entries {
                if row_indices.len() > start && row_indices.last() == Some(&row) {
                    if let Some(last) = values.last_mut() {
                        *last = last.faer_add(value);
                    }
                } else {
                    row_indices.push(row);
                    values.push(value);
                }
            }
            col_ptrs.push(row_indices.len());
        }

        let pattern = SparsityPattern::new(nrows, ncols, col_ptrs, row_indices)?;
        Self::new(pattern, values)
    }

    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    pub fn values(&self) -> &[E] {
        &self.values
    }

    /// Values of the given column, aligned with `pattern().row_indices_of_col(col)`.
    pub fn values_of_col(&self, col: usize) -> &[E] {
        &self.values[self.pattern.col_range(col)]
    }

    /// Squared Euclidean norm of every row, useful for row-scaling preconditioners.
    pub fn row_norms_squared(&self) -> Vec<E::Real> {
        let mut norms = vec![E::Real::faer_zero(); self.pattern.nrows()];
        for (&row, value) in self.pattern.row_indices().iter().zip(&self.values) {
            norms[row] = norms[row].faer_add(value.faer_abs2());
        }
        norms
    }
}

impl<E: ComplexField + SimpleEntity> CscOperator<E> {
    /// faer view of the matrix.
    pub fn as_ref(&self) -> SparseColMatRef<'_, usize, E> {
        SparseColMatRef::<'_, usize, E>::new(self.pattern.as_symbolic(), self.values.as_slice())
    }
}

impl<E: ComplexField + SimpleEntity> LinearOperator<E> for CscOperator<E> {
    fn nrows(&self) -> usize {
        self.pattern.nrows()
    }

    fn ncols(&self) -> usize {
        self.pattern.ncols()
    }

    fn apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        let m = self.pattern.nrows();
        let n = self.pattern.ncols();
        sparse_dense_matmul(
            mat::from_column_major_slice_mut::<E>(out, m, 1),
            self.as_ref(),
            mat::from_column_major_slice::<E>(rhs, n, 1),
            None,
            E::faer_one(),
            parallelism,
        );
    }

    // Aᴴ rhs is computed as the row vector rhsᵀ conj(A).
    fn adjoint_apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        let m = self.pattern.nrows();
        let n = self.pattern.ncols();
        dense_sparse_matmul(
            mat::from_column_major_slice_mut::<E>(out, 1, n),
            mat::from_column_major_slice::<E>(rhs, 1, m),
            self.as_ref().conjugate(),
            None,
            E::faer_one(),
            parallelism,
        );
    }
}
