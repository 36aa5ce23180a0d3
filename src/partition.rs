//! Domain decomposition into contiguous z-slabs.
//!
//! Blocks span the full x,y extent and partition the node planes
//! [0..=N3] along z. Slab boundaries are chosen so each worker gets close
//! to an equal share of the active nodes: an ascending greedy sweep extends
//! each slab while doing so moves its node count closer to the per-worker
//! target, and the last slab takes whatever remains.

use crate::grid::VoxelGrid;

/// Inclusive range of node planes [zmin..=zmax] owned by one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabRange {
    pub zmin: usize,
    pub zmax: usize,
}

impl SlabRange {
    /// Number of owned node planes.
    pub fn num_planes(&self) -> usize {
        self.zmax - self.zmin + 1
    }
}

/// Active-node count per z node plane, length N3 + 1.
pub fn slice_vertex_counts(grid: &VoxelGrid) -> Vec<usize> {
    let (n1, n2, n3) = grid.dims();
    let mut counts = Vec::with_capacity(n3 + 1);
    for z in 0..=n3 {
        let mut count = 0;
        for y in 0..=n2 {
            for x in 0..=n1 {
                if grid.is_vertex(x as i64, y as i64, z as i64) {
                    count += 1;
                }
            }
        }
        counts.push(count);
    }
    counts
}

/// Split the node planes into at most `num_threads` contiguous slabs with
/// balanced active-node counts.
///
/// Slabs that would start beyond the last plane are omitted, so the result
/// may have fewer entries than `num_threads`. With `num_threads == 1` the
/// single slab covers every plane.
pub fn decompose(grid: &VoxelGrid, num_threads: usize) -> Vec<SlabRange> {
    let (_, _, n3) = grid.dims();
    let counts = slice_vertex_counts(grid);
    let total: usize = counts.iter().sum();
    let target = total as f64 / num_threads as f64;

    let mut ranges = Vec::new();
    let mut z0: i64 = -1;
    for thread in 0..num_threads {
        let zmin = z0 + 1;
        let zmax;
        if thread == num_threads - 1 {
            zmax = n3 as i64;
        } else {
            let mut z = z0 + 1;
            if z < (n3 + 1) as i64 {
                let mut slab_count = counts[z as usize] as f64;
                loop {
                    if z >= n3 as i64 {
                        break;
                    }
                    let diff0 = (slab_count - target).abs();
                    z += 1;
                    if z <= n3 as i64 {
                        slab_count += counts[z as usize] as f64;
                    }
                    let diff1 = (slab_count - target).abs();
                    if diff1 >= diff0 {
                        z -= 1;
                        break;
                    }
                }
            }
            zmax = z;
            z0 = zmax;
        }
        if zmin <= n3 as i64 {
            ranges.push(SlabRange {
                zmin: zmin as usize,
                zmax: zmax as usize,
            });
        }
    }
    ranges
}
