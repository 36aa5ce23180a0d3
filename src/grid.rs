//! Voxel grid and nodal field storage.
//!
//! The domain is an N1 x N2 x N3 voxel grid. Each occupied voxel (BVF > 0)
//! is one 8-node hexahedral element; nodes live on the (N1+1) x (N2+1) x
//! (N3+1) corner lattice. Fields over nodes carry three components (one per
//! displacement direction) and are stored densely, x-fastest; reads outside
//! the lattice default to zero so padding probes near the domain boundary
//! need no special casing.

/// Bone-volume-fraction map: one byte per voxel, 0 = empty, 1..=100 =
/// volume-fraction percent.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    n1: usize,
    n2: usize,
    n3: usize,
    data: Vec<u8>,
}

impl VoxelGrid {
    /// Create an empty grid of the given voxel extents.
    pub fn new(n1: usize, n2: usize, n3: usize) -> Self {
        Self {
            n1,
            n2,
            n3,
            data: vec![0; n1 * n2 * n3],
        }
    }

    /// Create a grid filled by a per-voxel function.
    pub fn from_fn(n1: usize, n2: usize, n3: usize, mut f: impl FnMut(usize, usize, usize) -> u8) -> Self {
        let mut grid = Self::new(n1, n2, n3);
        for k in 0..n3 {
            for j in 0..n2 {
                for i in 0..n1 {
                    let v = f(i, j, k);
                    grid.data[(k * n2 + j) * n1 + i] = v;
                }
            }
        }
        grid
    }

    /// Voxel extents (N1, N2, N3).
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.n1, self.n2, self.n3)
    }

    /// BVF value at a voxel; zero outside the grid.
    pub fn value(&self, x: i64, y: i64, z: i64) -> u8 {
        if x < 0 || y < 0 || z < 0 {
            return 0;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.n1 || y >= self.n2 || z >= self.n3 {
            return 0;
        }
        self.data[(z * self.n2 + y) * self.n1 + x]
    }

    /// Set the BVF value of an in-bounds voxel.
    pub fn set(&mut self, value: u8, x: usize, y: usize, z: usize) {
        assert!(x < self.n1 && y < self.n2 && z < self.n3, "voxel out of bounds");
        self.data[(z * self.n2 + y) * self.n1 + x] = value;
    }

    /// True iff the voxel exists and is occupied.
    pub fn is_element(&self, x: i64, y: i64, z: i64) -> bool {
        self.value(x, y, z) > 0
    }

    /// True iff the lattice node touches at least one occupied voxel.
    pub fn is_vertex(&self, x: i64, y: i64, z: i64) -> bool {
        for dz in 0..=1 {
            for dy in 0..=1 {
                for dx in 0..=1 {
                    if self.is_element(x - dx, y - dy, z - dz) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// True iff no voxel is occupied.
    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }
}

/// Dense field over the node lattice with three components per node.
///
/// Shape (3, N1+1, N2+1, N3+1), x-fastest within each component. This is the
/// dense realisation of the coordinate-sparse 4D arrays the solver consumes
/// and produces; reads outside the lattice default to `T::default()`.
#[derive(Debug, Clone)]
pub struct NodeArray<T> {
    m1: usize,
    m2: usize,
    m3: usize,
    data: Vec<T>,
}

/// Nodal displacement / force field (f32 components).
pub type NodeField = NodeArray<f32>;

/// Dirichlet mask: 1 where a DOF is fixed.
pub type NodeMask = NodeArray<u8>;

impl<T: Copy + Default> NodeArray<T> {
    /// Create a zeroed field over the node lattice of `grid`.
    pub fn for_grid(grid: &VoxelGrid) -> Self {
        let (n1, n2, n3) = grid.dims();
        Self::new(n1 + 1, n2 + 1, n3 + 1)
    }

    /// Create a zeroed field with the given node extents.
    pub fn new(m1: usize, m2: usize, m3: usize) -> Self {
        Self {
            m1,
            m2,
            m3,
            data: vec![T::default(); 3 * m1 * m2 * m3],
        }
    }

    /// Node extents (N1+1, N2+1, N3+1).
    pub fn node_dims(&self) -> (usize, usize, usize) {
        (self.m1, self.m2, self.m3)
    }

    /// True iff this field covers the node lattice of `grid`.
    pub fn matches_grid(&self, grid: &VoxelGrid) -> bool {
        let (n1, n2, n3) = grid.dims();
        (self.m1, self.m2, self.m3) == (n1 + 1, n2 + 1, n3 + 1)
    }

    /// Component `d` at node (x, y, z); default outside the lattice.
    pub fn value(&self, d: usize, x: i64, y: i64, z: i64) -> T {
        debug_assert!(d < 3);
        if x < 0 || y < 0 || z < 0 {
            return T::default();
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.m1 || y >= self.m2 || z >= self.m3 {
            return T::default();
        }
        self.data[((d * self.m3 + z) * self.m2 + y) * self.m1 + x]
    }

    /// Set component `d` at an in-bounds node.
    pub fn set(&mut self, value: T, d: usize, x: usize, y: usize, z: usize) {
        assert!(d < 3 && x < self.m1 && y < self.m2 && z < self.m3, "node out of bounds");
        self.data[((d * self.m3 + z) * self.m2 + y) * self.m1 + x] = value;
    }
}

/// Dense per-element scalar field, shape (N1, N2, N3).
#[derive(Debug, Clone)]
pub struct ElementField {
    n1: usize,
    n2: usize,
    n3: usize,
    data: Vec<f32>,
}

impl ElementField {
    /// Create a zeroed field over the voxels of `grid`.
    pub fn for_grid(grid: &VoxelGrid) -> Self {
        let (n1, n2, n3) = grid.dims();
        Self {
            n1,
            n2,
            n3,
            data: vec![0.0; n1 * n2 * n3],
        }
    }

    /// Voxel extents (N1, N2, N3).
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.n1, self.n2, self.n3)
    }

    /// Value at a voxel; zero outside the grid.
    pub fn value(&self, x: i64, y: i64, z: i64) -> f32 {
        if x < 0 || y < 0 || z < 0 {
            return 0.0;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.n1 || y >= self.n2 || z >= self.n3 {
            return 0.0;
        }
        self.data[(z * self.n2 + y) * self.n1 + x]
    }

    /// Set the value of an in-bounds voxel.
    pub fn set(&mut self, value: f32, x: usize, y: usize, z: usize) {
        assert!(x < self.n1 && y < self.n2 && z < self.n3, "voxel out of bounds");
        self.data[(z * self.n2 + y) * self.n1 + x] = value;
    }
}
