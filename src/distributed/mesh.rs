//! Logical process mesh
//!
//! A `ProcessMesh` arranges worker ranks in an N-dimensional grid with a
//! unique name per dimension (e.g. `["x", "y"]`). Sharding specs refer to
//! mesh dimensions by name; collectives run over the ranks that vary along
//! one dimension while every other coordinate is fixed.

use std::collections::HashSet;

use crate::error::{Error, Result};

/// Named grid of worker ranks. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMesh {
    shape: Vec<usize>,
    process_ids: Vec<usize>,
    dim_names: Vec<String>,
}

impl ProcessMesh {
    /// Create a mesh from its shape, the row-major list of process ids
    /// occupying each coordinate, and one unique name per dimension.
    ///
    /// ```
    /// # use shardopt::distributed::ProcessMesh;
    /// let mesh = ProcessMesh::new(&[2, 2], vec![0, 1, 2, 3], &["x", "y"]).unwrap();
    /// assert_eq!(mesh.coords_of(2).unwrap(), vec![1, 0]);
    /// ```
    pub fn new<S: AsRef<str>>(
        shape: &[usize],
        process_ids: Vec<usize>,
        dim_names: &[S],
    ) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::config("process mesh must have at least one dimension"));
        }
        if let Some(d) = shape.iter().position(|&s| s == 0) {
            return Err(Error::config(format!(
                "process mesh dimension {d} has size 0"
            )));
        }
        if dim_names.len() != shape.len() {
            return Err(Error::config(format!(
                "got {} dimension names for a {}D mesh",
                dim_names.len(),
                shape.len()
            )));
        }

        let mut seen_names = HashSet::new();
        for name in dim_names {
            if !seen_names.insert(name.as_ref()) {
                return Err(Error::config(format!(
                    "duplicate mesh dimension name '{}'",
                    name.as_ref()
                )));
            }
        }

        let expected = shape.iter().product::<usize>();
        if process_ids.len() != expected {
            return Err(Error::config(format!(
                "process count ({}) doesn't match mesh shape {:?}",
                process_ids.len(),
                shape
            )));
        }

        let mut seen_ids = HashSet::new();
        for &id in &process_ids {
            if !seen_ids.insert(id) {
                return Err(Error::config(format!(
                    "process id {id} appears twice in mesh"
                )));
            }
        }

        Ok(Self {
            shape: shape.to_vec(),
            process_ids,
            dim_names: dim_names.iter().map(|n| n.as_ref().to_string()).collect(),
        })
    }

    /// Mesh whose process ids are `0..product(shape)` in row-major order.
    pub fn grid<S: AsRef<str>>(shape: &[usize], dim_names: &[S]) -> Result<Self> {
        let n = shape.iter().product::<usize>();
        Self::new(shape, (0..n).collect(), dim_names)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn dim_names(&self) -> &[String] {
        &self.dim_names
    }

    pub fn process_ids(&self) -> &[usize] {
        &self.process_ids
    }

    /// Total number of ranks in the mesh.
    pub fn world_size(&self) -> usize {
        self.process_ids.len()
    }

    /// Index of a named dimension.
    pub fn dim_index(&self, name: &str) -> Result<usize> {
        self.dim_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| {
                Error::config(format!(
                    "mesh has no dimension '{name}' (dimensions: {:?})",
                    self.dim_names
                ))
            })
    }

    /// Size of a named dimension.
    pub fn dim_size(&self, name: &str) -> Result<usize> {
        Ok(self.shape[self.dim_index(name)?])
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.process_ids.contains(&rank)
    }

    /// Coordinates of `rank` in the grid.
    pub fn coords_of(&self, rank: usize) -> Result<Vec<usize>> {
        let flat = self
            .process_ids
            .iter()
            .position(|&p| p == rank)
            .ok_or_else(|| Error::config(format!("rank {rank} is not part of the mesh")))?;

        let mut coords = vec![0; self.shape.len()];
        let mut rem = flat;
        for d in (0..self.shape.len()).rev() {
            coords[d] = rem % self.shape[d];
            rem /= self.shape[d];
        }
        Ok(coords)
    }

    /// Rank occupying `coords`.
    pub fn rank_at(&self, coords: &[usize]) -> Result<usize> {
        if coords.len() != self.shape.len() {
            return Err(Error::config(format!(
                "expected {} coordinates, got {}",
                self.shape.len(),
                coords.len()
            )));
        }
        let mut flat = 0;
        for (d, (&c, &s)) in coords.iter().zip(&self.shape).enumerate() {
            if c >= s {
                return Err(Error::config(format!(
                    "coordinate {c} out of range for dimension {d} of size {s}"
                )));
            }
            flat = flat * s + c;
        }
        Ok(self.process_ids[flat])
    }

    /// Ranks that share every coordinate with `rank` except along `dim`,
    /// ordered by their coordinate along `dim`.
    pub fn group_along(&self, rank: usize, dim: &str) -> Result<Vec<usize>> {
        let d = self.dim_index(dim)?;
        let mut coords = self.coords_of(rank)?;
        (0..self.shape[d])
            .map(|c| {
                coords[d] = c;
                self.rank_at(&coords)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh_2x2() -> ProcessMesh {
        ProcessMesh::new(&[2, 2], vec![0, 1, 2, 3], &["x", "y"]).unwrap()
    }

    #[test]
    fn test_mesh_2x2_coords() {
        let mesh = mesh_2x2();
        assert_eq!(mesh.world_size(), 4);
        assert_eq!(mesh.coords_of(0).unwrap(), vec![0, 0]);
        assert_eq!(mesh.coords_of(1).unwrap(), vec![0, 1]);
        assert_eq!(mesh.coords_of(3).unwrap(), vec![1, 1]);
        assert_eq!(mesh.rank_at(&[1, 0]).unwrap(), 2);
    }

    #[test]
    fn test_mesh_groups() {
        let mesh = mesh_2x2();
        assert_eq!(mesh.group_along(0, "x").unwrap(), vec![0, 2]);
        assert_eq!(mesh.group_along(3, "x").unwrap(), vec![1, 3]);
        assert_eq!(mesh.group_along(2, "y").unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_mesh_custom_process_ids() {
        let mesh = ProcessMesh::new(&[2], vec![7, 3], &["dp"]).unwrap();
        assert_eq!(mesh.coords_of(3).unwrap(), vec![1]);
        assert_eq!(mesh.group_along(7, "dp").unwrap(), vec![7, 3]);
        assert!(mesh.coords_of(0).is_err());
    }

    #[test]
    fn test_mesh_dim_names_must_be_unique() {
        let err = ProcessMesh::new(&[2, 2], vec![0, 1, 2, 3], &["x", "x"]).unwrap_err();
        assert!(err.to_string().contains("duplicate mesh dimension name"));
    }

    #[test]
    fn test_mesh_process_count_must_match_shape() {
        let err = ProcessMesh::new(&[3, 2], vec![0, 1, 2, 3], &["x", "y"]).unwrap_err();
        assert!(
            err.to_string()
                .contains("process count (4) doesn't match mesh shape [3, 2]")
        );
    }

    #[test]
    fn test_mesh_rejects_bad_shapes() {
        assert!(ProcessMesh::grid::<&str>(&[], &[]).is_err());
        assert!(ProcessMesh::grid(&[2, 0], &["x", "y"]).is_err());
        assert!(ProcessMesh::grid(&[2, 2], &["x"]).is_err());
        assert!(ProcessMesh::new(&[2], vec![1, 1], &["x"]).is_err());
    }

    #[test]
    fn test_mesh_unknown_dim() {
        let mesh = mesh_2x2();
        assert!(mesh.dim_index("z").is_err());
        assert_eq!(mesh.dim_size("y").unwrap(), 2);
    }
}
