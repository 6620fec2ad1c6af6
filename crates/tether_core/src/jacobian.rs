//! Sparse Jacobian and adjoint assembly over block sparsity patterns.
//!
//! Inputs and outputs are grouped into bindings; each (output, input) pair
//! carries a compressed column-major sparsity pattern of the possibly
//! nonzero entries. Columns whose nonzero row sets are disjoint share a
//! seed color and are extracted with a single derivative evaluation; a
//! greedy first-fit pass produces the coloring when the caller does not
//! supply one.

use crate::config::DerivativeSettings;
use crate::error::FmuError;
use crate::model::{IoBinding, Model};
use crate::pool::Slot;
use crate::sensitivity::{eval_derivative, ValidationSink};
use anyhow::{ensure, Context, Result};
use nalgebra::DMatrix;
use nalgebra_sparse::pattern::SparsityPattern;

/// Builds a column-major pattern from (row, column) entries. Entries may be
/// unsorted and may repeat.
pub fn pattern_from_entries(
    n_rows: usize,
    n_cols: usize,
    entries: &[(usize, usize)],
) -> Result<SparsityPattern> {
    let mut lanes: Vec<Vec<usize>> = vec![Vec::new(); n_cols];
    for &(row, col) in entries {
        ensure!(
            row < n_rows && col < n_cols,
            "entry ({row}, {col}) outside a {n_rows}x{n_cols} pattern"
        );
        lanes[col].push(row);
    }
    let mut offsets = Vec::with_capacity(n_cols + 1);
    let mut indices = Vec::with_capacity(entries.len());
    offsets.push(0);
    for lane in &mut lanes {
        lane.sort_unstable();
        lane.dedup();
        indices.extend_from_slice(lane);
        offsets.push(indices.len());
    }
    SparsityPattern::try_from_offsets_and_indices(n_cols, n_rows, offsets, indices)
        .context("building sparsity pattern")
}

/// Pattern with every entry present.
pub fn dense_pattern(n_rows: usize, n_cols: usize) -> Result<SparsityPattern> {
    let offsets = (0..=n_cols).map(|c| c * n_rows).collect();
    let indices = (0..n_cols).flat_map(|_| 0..n_rows).collect();
    SparsityPattern::try_from_offsets_and_indices(n_cols, n_rows, offsets, indices)
        .context("building dense pattern")
}

/// Block sparsity structure plus the seed coloring derived from it. Column
/// indices are flat across input bindings, row indices flat across output
/// bindings.
pub struct JacobianLayout {
    /// Per (output binding, input binding) pattern, column-major.
    pub(crate) blocks: Vec<Vec<SparsityPattern>>,
    /// Groups of flat columns extracted together.
    pub(crate) coloring: Vec<Vec<usize>>,
    /// Flat row offset per output binding, one past the end last.
    pub(crate) out_offsets: Vec<usize>,
    /// Flat column to (input binding, local column).
    pub(crate) offset_map: Vec<(usize, usize)>,
}

impl JacobianLayout {
    /// Validates block dimensions against the bindings and fixes the
    /// coloring, greedily computed unless one is given.
    pub fn new(
        inputs: &[IoBinding],
        outputs: &[IoBinding],
        blocks: Vec<Vec<SparsityPattern>>,
        coloring: Option<Vec<Vec<usize>>>,
    ) -> Result<Self> {
        ensure!(
            blocks.len() == outputs.len(),
            "expected one block row per output binding, got {} for {}",
            blocks.len(),
            outputs.len()
        );
        for (j1, row) in blocks.iter().enumerate() {
            ensure!(
                row.len() == inputs.len(),
                "output binding {} has {} blocks for {} input bindings",
                outputs[j1].name,
                row.len(),
                inputs.len()
            );
            for (i1, pattern) in row.iter().enumerate() {
                ensure!(
                    pattern.major_dim() == inputs[i1].ids.len()
                        && pattern.minor_dim() == outputs[j1].ids.len(),
                    "block ({}, {}) is {}x{}, bindings are {}x{}",
                    outputs[j1].name,
                    inputs[i1].name,
                    pattern.minor_dim(),
                    pattern.major_dim(),
                    outputs[j1].ids.len(),
                    inputs[i1].ids.len()
                );
            }
        }

        let mut offset_map = Vec::new();
        for (i1, binding) in inputs.iter().enumerate() {
            for i2 in 0..binding.ids.len() {
                offset_map.push((i1, i2));
            }
        }
        let mut out_offsets = vec![0];
        for binding in outputs {
            out_offsets.push(out_offsets[out_offsets.len() - 1] + binding.ids.len());
        }

        let n_cols = offset_map.len();
        let n_rows = out_offsets[out_offsets.len() - 1];
        let rows_of: Vec<Vec<usize>> = (0..n_cols)
            .map(|c| {
                let (i1, i2) = offset_map[c];
                let mut rows = Vec::new();
                for j1 in 0..outputs.len() {
                    for &row in blocks[j1][i1].lane(i2) {
                        rows.push(out_offsets[j1] + row);
                    }
                }
                rows
            })
            .collect();

        let coloring = match coloring {
            Some(coloring) => {
                let mut seen = vec![false; n_cols];
                for group in &coloring {
                    for &c in group {
                        ensure!(c < n_cols, "colored column {c} out of range ({n_cols})");
                        ensure!(!seen[c], "column {c} colored twice");
                        seen[c] = true;
                    }
                }
                ensure!(
                    seen.iter().all(|&s| s),
                    "coloring must cover every column exactly once"
                );
                coloring
            }
            None => greedy_coloring(n_rows, &rows_of),
        };

        Ok(Self {
            blocks,
            coloring,
            out_offsets,
            offset_map,
        })
    }

    pub fn n_cols(&self) -> usize {
        self.offset_map.len()
    }

    pub fn n_rows(&self) -> usize {
        self.out_offsets[self.out_offsets.len() - 1]
    }

    pub fn n_colors(&self) -> usize {
        self.coloring.len()
    }
}

/// First-fit coloring: a column joins the first group whose occupied rows it
/// does not touch.
fn greedy_coloring(n_rows: usize, rows_of: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut occupied: Vec<Vec<bool>> = Vec::new();
    for (c, rows) in rows_of.iter().enumerate() {
        let found = (0..groups.len()).find(|&g| rows.iter().all(|&r| !occupied[g][r]));
        let g = match found {
            Some(g) => g,
            None => {
                groups.push(Vec::new());
                occupied.push(vec![false; n_rows]);
                groups.len() - 1
            }
        };
        groups[g].push(c);
        for &r in rows {
            occupied[g][r] = true;
        }
    }
    groups
}

/// What to do with the extracted nonzeros.
pub(crate) enum AssembleMode<'a> {
    /// Scatter into per-block dense matrices, indexed [output][input].
    Jacobian(&'a mut Vec<Vec<DMatrix<f64>>>),
    /// Accumulate the transpose product with the given per-output seeds into
    /// per-input gradients.
    Adjoint {
        seeds: &'a [&'a [f64]],
        accum: &'a mut Vec<Vec<f64>>,
    },
}

/// Extracts all nonzeros color by color against a primed slot. Each color
/// seeds its columns with the input nominals and requests exactly the rows
/// its patterns name, so one derivative evaluation serves the whole group.
pub(crate) fn assemble(
    slot: &mut Slot,
    model: &Model,
    settings: &DerivativeSettings,
    inputs: &[IoBinding],
    outputs: &[IoBinding],
    layout: &JacobianLayout,
    sink: &dyn ValidationSink,
    mut mode: AssembleMode<'_>,
) -> Result<(), FmuError> {
    for group in &layout.coloring {
        if group.is_empty() {
            continue;
        }
        for &c in group {
            let (i1, i2) = layout.offset_map[c];
            let id_in = inputs[i1].ids[i2];
            slot.set_seed(id_in, model.variable(id_in).nominal);
            for (j1, out) in outputs.iter().enumerate() {
                for &row in layout.blocks[j1][i1].lane(i2) {
                    slot.request(out.ids[row], Some(id_in));
                }
            }
        }
        eval_derivative(slot, model, settings, sink)?;
        for &c in group {
            let (i1, i2) = layout.offset_map[c];
            let id_in = inputs[i1].ids[i2];
            // Seeds carry the nominal, scale it back out of the result.
            let inv_nom = 1.0 / model.variable(id_in).nominal;
            for (j1, out) in outputs.iter().enumerate() {
                for &row in layout.blocks[j1][i1].lane(i2) {
                    let nz = slot.sensitivity(out.ids[row]) * inv_nom;
                    match &mut mode {
                        AssembleMode::Jacobian(jac) => jac[j1][i1][(row, i2)] = nz,
                        AssembleMode::Adjoint { seeds, accum } => {
                            accum[i1][i2] += seeds[j1][row] * nz;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{dense_pattern, pattern_from_entries, JacobianLayout};
    use crate::model::IoBinding;

    fn binding(name: &str, ids: &[usize]) -> IoBinding {
        IoBinding::new(name, ids.to_vec())
    }

    #[test]
    fn entries_are_sorted_and_deduplicated() {
        let p = pattern_from_entries(3, 2, &[(2, 0), (0, 0), (2, 0), (1, 1)]).unwrap();
        assert_eq!(p.lane(0), &[0, 2]);
        assert_eq!(p.lane(1), &[1]);
    }

    #[test]
    fn out_of_range_entry_is_rejected() {
        assert!(pattern_from_entries(2, 2, &[(2, 0)]).is_err());
        assert!(pattern_from_entries(2, 2, &[(0, 2)]).is_err());
    }

    #[test]
    fn dense_block_gets_one_color_per_column() {
        let inputs = [binding("u", &[0, 1, 2])];
        let outputs = [binding("y", &[3, 4])];
        let blocks = vec![vec![dense_pattern(2, 3).unwrap()]];
        let layout = JacobianLayout::new(&inputs, &outputs, blocks, None).unwrap();
        assert_eq!(layout.n_colors(), 3);
    }

    #[test]
    fn structurally_independent_columns_share_a_color() {
        // Diagonal pattern: all columns hit distinct rows.
        let inputs = [binding("u", &[0, 1, 2])];
        let outputs = [binding("y", &[3, 4, 5])];
        let diag = pattern_from_entries(3, 3, &[(0, 0), (1, 1), (2, 2)]).unwrap();
        let layout = JacobianLayout::new(&inputs, &outputs, vec![vec![diag]], None).unwrap();
        assert_eq!(layout.n_colors(), 1);
        assert_eq!(layout.coloring[0], vec![0, 1, 2]);
    }

    #[test]
    fn coloring_spans_blocks_of_both_bindings() {
        // Two input bindings, one output binding. Column 0 of the first
        // binding and column 0 of the second touch disjoint rows.
        let inputs = [binding("u", &[0]), binding("w", &[1])];
        let outputs = [binding("y", &[2, 3])];
        let top = pattern_from_entries(2, 1, &[(0, 0)]).unwrap();
        let bottom = pattern_from_entries(2, 1, &[(1, 0)]).unwrap();
        let layout = JacobianLayout::new(&inputs, &outputs, vec![vec![top, bottom]], None).unwrap();
        assert_eq!(layout.n_cols(), 2);
        assert_eq!(layout.n_colors(), 1);
    }

    #[test]
    fn explicit_coloring_must_partition_the_columns() {
        let inputs = [binding("u", &[0, 1])];
        let outputs = [binding("y", &[2])];
        let blocks = vec![vec![dense_pattern(1, 2).unwrap()]];

        let missing = JacobianLayout::new(&inputs, &outputs, blocks.clone(), Some(vec![vec![0]]));
        assert!(missing.is_err());

        let doubled = JacobianLayout::new(
            &inputs,
            &outputs,
            blocks.clone(),
            Some(vec![vec![0], vec![0, 1]]),
        );
        assert!(doubled.is_err());

        let ok = JacobianLayout::new(&inputs, &outputs, blocks, Some(vec![vec![0], vec![1]]));
        assert!(ok.is_ok());
    }

    #[test]
    fn mismatched_block_dimensions_are_rejected() {
        let inputs = [binding("u", &[0, 1])];
        let outputs = [binding("y", &[2])];
        let wrong = vec![vec![dense_pattern(2, 2).unwrap()]];
        assert!(JacobianLayout::new(&inputs, &outputs, wrong, None).is_err());
    }
}
