use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

/// Output representation policy for every Jacobian-producing call, held
/// on the configuration. Callers composing Jacobians from heterogeneous
/// sources rely on getting the same representation everywhere.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JacobianMode {
    #[default]
    Dense,
    Sparse,
    RowShifted,
    /// suppress Jacobian computation, values only
    NoJacobian,
}

/// Coordinate-format Jacobian: explicit (row, col, value) triplets.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseJacobian {
    pub rows: usize,
    pub cols: usize,
    pub triplets: Vec<(usize, usize, f64)>,
}

/// Banded storage: each row keeps `width` contiguous entries starting at
/// its shift. Kinematic-chain Jacobians have contiguous support per row,
/// which this exploits for long trajectories.
#[derive(Debug, Clone, PartialEq)]
pub struct RowShiftedJacobian {
    pub rows: usize,
    pub cols: usize,
    pub width: usize,
    pub shifts: Vec<usize>,
    pub data: DMatrix<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Jacobian {
    Dense(DMatrix<f64>),
    Sparse(SparseJacobian),
    RowShifted(RowShiftedJacobian),
    NoJacobian,
}

impl Jacobian {
    pub fn mode(&self) -> JacobianMode {
        match self {
            Jacobian::Dense(_) => JacobianMode::Dense,
            Jacobian::Sparse(_) => JacobianMode::Sparse,
            Jacobian::RowShifted(_) => JacobianMode::RowShifted,
            Jacobian::NoJacobian => JacobianMode::NoJacobian,
        }
    }

    /// Densify, whatever the representation. `None` for suppressed
    /// Jacobians.
    pub fn to_dense(&self) -> Option<DMatrix<f64>> {
        match self {
            Jacobian::Dense(m) => Some(m.clone()),
            Jacobian::Sparse(s) => {
                let mut m = DMatrix::zeros(s.rows, s.cols);
                for &(r, c, v) in &s.triplets {
                    m[(r, c)] += v;
                }
                Some(m)
            }
            Jacobian::RowShifted(rs) => {
                let mut m = DMatrix::zeros(rs.rows, rs.cols);
                for r in 0..rs.rows {
                    for k in 0..rs.width {
                        let c = rs.shifts[r] + k;
                        if c < rs.cols {
                            m[(r, c)] += rs.data[(r, k)];
                        }
                    }
                }
                Some(m)
            }
            Jacobian::NoJacobian => None,
        }
    }
}

/// Accumulates per-joint contributions as triplets; the representation is
/// chosen once, at emission. Post-composition (cross products, quaternion
/// maps) happens here so that every output mode shares one code path.
#[derive(Debug, Clone)]
pub(crate) struct JacobianAccumulator {
    rows: usize,
    cols: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl JacobianAccumulator {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.rows && col < self.cols);
        self.entries.push((row, col, value));
    }

    /// Adds a 3-vector as one column.
    pub fn add_column(&mut self, col: usize, v: Vector3<f64>) {
        self.add(0, col, v.x);
        self.add(1, col, v.y);
        self.add(2, col, v.z);
    }

    /// Replaces J by M * J for a small dense M with `rows()` columns.
    pub fn premultiply(&mut self, m: &DMatrix<f64>) {
        debug_assert_eq!(m.ncols(), self.rows);
        let old = std::mem::take(&mut self.entries);
        self.rows = m.nrows();
        for (r, c, v) in old {
            for i in 0..m.nrows() {
                let w = m[(i, r)] * v;
                if w != 0.0 {
                    self.entries.push((i, c, w));
                }
            }
        }
    }

    /// Replaces each 3-column j by j x v (the lever-arm product turning
    /// angular contributions into point velocities).
    pub fn cross(&mut self, v: Vector3<f64>) {
        debug_assert_eq!(self.rows, 3);
        let old = std::mem::take(&mut self.entries);
        for (r, c, a) in old {
            // e_r x v expanded per source row
            match r {
                0 => {
                    self.entries.push((1, c, -a * v.z));
                    self.entries.push((2, c, a * v.y));
                }
                1 => {
                    self.entries.push((0, c, a * v.z));
                    self.entries.push((2, c, -a * v.x));
                }
                _ => {
                    self.entries.push((0, c, -a * v.y));
                    self.entries.push((1, c, a * v.x));
                }
            }
        }
    }

    /// Stacks copies of `blocks` vertically into a taller accumulator.
    pub fn stack(blocks: Vec<JacobianAccumulator>) -> Self {
        let cols = blocks.first().map(|b| b.cols).unwrap_or(0);
        let rows = blocks.iter().map(|b| b.rows).sum();
        let mut entries = Vec::new();
        let mut offset = 0;
        for b in blocks {
            debug_assert_eq!(b.cols, cols);
            entries.extend(b.entries.iter().map(|&(r, c, v)| (r + offset, c, v)));
            offset += b.rows;
        }
        Self {
            rows,
            cols,
            entries,
        }
    }

    pub fn emit(self, mode: JacobianMode) -> Jacobian {
        match mode {
            JacobianMode::Dense => {
                let mut m = DMatrix::zeros(self.rows, self.cols);
                for (r, c, v) in self.entries {
                    m[(r, c)] += v;
                }
                Jacobian::Dense(m)
            }
            JacobianMode::Sparse => {
                let mut triplets = self.entries;
                triplets.sort_by_key(|&(r, c, _)| (r, c));
                let mut merged: Vec<(usize, usize, f64)> = Vec::with_capacity(triplets.len());
                for (r, c, v) in triplets {
                    match merged.last_mut() {
                        Some(last) if last.0 == r && last.1 == c => last.2 += v,
                        _ => merged.push((r, c, v)),
                    }
                }
                merged.retain(|&(_, _, v)| v != 0.0);
                Jacobian::Sparse(SparseJacobian {
                    rows: self.rows,
                    cols: self.cols,
                    triplets: merged,
                })
            }
            JacobianMode::RowShifted => {
                let mut lo = vec![usize::MAX; self.rows];
                let mut hi = vec![0usize; self.rows];
                for &(r, c, _) in &self.entries {
                    lo[r] = lo[r].min(c);
                    hi[r] = hi[r].max(c);
                }
                let width = (0..self.rows)
                    .filter(|&r| lo[r] != usize::MAX)
                    .map(|r| hi[r] - lo[r] + 1)
                    .max()
                    .unwrap_or(0);
                let shifts: Vec<usize> = lo
                    .iter()
                    .map(|&l| if l == usize::MAX { 0 } else { l })
                    .collect();
                let mut data = DMatrix::zeros(self.rows, width);
                for (r, c, v) in self.entries {
                    data[(r, c - shifts[r])] += v;
                }
                Jacobian::RowShifted(RowShiftedJacobian {
                    rows: self.rows,
                    cols: self.cols,
                    width,
                    shifts,
                    data,
                })
            }
            JacobianMode::NoJacobian => Jacobian::NoJacobian,
        }
    }
}
