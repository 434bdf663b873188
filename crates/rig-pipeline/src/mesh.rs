//! The mesh oracle: ray intersections against a previously built surface
//! mesh.
//!
//! The mesh machinery proper (loading, acceleration) is a narrow external
//! concern; the pipeline only consumes [`MeshOracle`]. The triangle mesh
//! shipped here is a minimal implementation of that interface: a PLY
//! loader, a median-split bounding-box tree, and Möller–Trumbore
//! intersection.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;
use rig_core::{Pt3, Real, Vec3};

/// Ray intersections against the constraining surface.
pub trait MeshOracle: Send + Sync {
    /// First intersection of `origin + t · dir` with the surface for
    /// `t ∈ [min_dist, max_dist]`, or `None`. `dir` must be unit length.
    fn intersect_ray(
        &self,
        origin: &Pt3,
        dir: &Vec3,
        min_dist: Real,
        max_dist: Real,
    ) -> Option<Pt3>;
}

#[derive(Debug, Clone, Copy)]
struct Aabb {
    min: Vec3,
    max: Vec3,
}

impl Aabb {
    fn empty() -> Self {
        Self {
            min: Vec3::from_element(Real::INFINITY),
            max: Vec3::from_element(Real::NEG_INFINITY),
        }
    }

    fn grow(&mut self, p: &Pt3) {
        self.min = self.min.inf(&p.coords);
        self.max = self.max.sup(&p.coords);
    }

    fn merge(&mut self, other: &Aabb) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    /// Slab test; returns whether the ray hits within `[t_min, t_max]`.
    fn hit(&self, origin: &Pt3, inv_dir: &Vec3, t_min: Real, t_max: Real) -> bool {
        let mut lo = t_min;
        let mut hi = t_max;
        for i in 0..3 {
            let t0 = (self.min[i] - origin[i]) * inv_dir[i];
            let t1 = (self.max[i] - origin[i]) * inv_dir[i];
            let (t0, t1) = if t0 <= t1 { (t0, t1) } else { (t1, t0) };
            lo = lo.max(t0);
            hi = hi.min(t1);
            if lo > hi {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
enum BvhNode {
    Leaf {
        bounds: Aabb,
        start: usize,
        count: usize,
    },
    Inner {
        bounds: Aabb,
        left: usize,
        right: usize,
    },
}

/// A triangle soup with a bounding-volume tree.
#[derive(Debug, Clone)]
pub struct TriangleMesh {
    vertices: Vec<Pt3>,
    triangles: Vec<[u32; 3]>,
    /// Triangle order after tree construction.
    order: Vec<usize>,
    nodes: Vec<BvhNode>,
}

const LEAF_SIZE: usize = 8;

impl TriangleMesh {
    pub fn new(vertices: Vec<Pt3>, triangles: Vec<[u32; 3]>) -> Result<Self> {
        for tri in &triangles {
            for &v in tri {
                if v as usize >= vertices.len() {
                    bail!("triangle references missing vertex {}", v);
                }
            }
        }
        if triangles.is_empty() {
            bail!("mesh has no triangles");
        }

        let mut mesh = Self {
            vertices,
            triangles,
            order: Vec::new(),
            nodes: Vec::new(),
        };
        mesh.build_tree();
        Ok(mesh)
    }

    pub fn num_triangles(&self) -> usize {
        self.triangles.len()
    }

    fn centroid(&self, tri: usize) -> Vec3 {
        let [a, b, c] = self.triangles[tri];
        (self.vertices[a as usize].coords
            + self.vertices[b as usize].coords
            + self.vertices[c as usize].coords)
            / 3.0
    }

    fn tri_bounds(&self, tri: usize) -> Aabb {
        let mut b = Aabb::empty();
        for &v in &self.triangles[tri] {
            b.grow(&self.vertices[v as usize]);
        }
        b
    }

    fn build_tree(&mut self) {
        let mut order: Vec<usize> = (0..self.triangles.len()).collect();
        self.nodes.clear();
        self.build_node(&mut order, 0, self.triangles.len());
        self.order = order;
    }

    /// Recursively build the node over `order[start..start+count]`,
    /// splitting at the median along the widest centroid axis.
    fn build_node(&mut self, order: &mut [usize], start: usize, count: usize) -> usize {
        let mut bounds = Aabb::empty();
        let mut centroid_bounds = Aabb::empty();
        for &tri in &order[start..start + count] {
            bounds.merge(&self.tri_bounds(tri));
            centroid_bounds.grow(&Pt3::from(self.centroid(tri)));
        }

        let node_idx = self.nodes.len();
        if count <= LEAF_SIZE {
            self.nodes.push(BvhNode::Leaf {
                bounds,
                start,
                count,
            });
            return node_idx;
        }

        let extent = centroid_bounds.max - centroid_bounds.min;
        let axis = if extent.x >= extent.y && extent.x >= extent.z {
            0
        } else if extent.y >= extent.z {
            1
        } else {
            2
        };

        let mid = count / 2;
        let centroids: Vec<(usize, Real)> = order[start..start + count]
            .iter()
            .map(|&t| (t, self.centroid(t)[axis]))
            .collect();
        let mut sorted = centroids;
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        for (k, (t, _)) in sorted.into_iter().enumerate() {
            order[start + k] = t;
        }

        self.nodes.push(BvhNode::Leaf {
            // placeholder, replaced below
            bounds,
            start,
            count,
        });
        let left = self.build_node(order, start, mid);
        let right = self.build_node(order, start + mid, count - mid);
        self.nodes[node_idx] = BvhNode::Inner {
            bounds,
            left,
            right,
        };
        node_idx
    }

    /// Möller–Trumbore ray-triangle intersection; returns the ray
    /// parameter.
    fn intersect_triangle(&self, tri: usize, origin: &Pt3, dir: &Vec3) -> Option<Real> {
        let [ia, ib, ic] = self.triangles[tri];
        let a = self.vertices[ia as usize];
        let b = self.vertices[ib as usize];
        let c = self.vertices[ic as usize];

        let e1 = b - a;
        let e2 = c - a;
        let p = dir.cross(&e2);
        let det = e1.dot(&p);
        if det.abs() < 1e-14 {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = origin - a;
        let u = s.dot(&p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(&e1);
        let v = dir.dot(&q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = e2.dot(&q) * inv_det;
        if t <= 0.0 {
            return None;
        }
        Some(t)
    }

    /// Load an ASCII or binary little-endian PLY mesh.
    pub fn load_ply(path: &Path) -> Result<Self> {
        info!("loading mesh: {}", path.display());
        let file = fs::File::open(path)
            .with_context(|| format!("cannot open mesh {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let mut num_vertices = 0usize;
        let mut num_faces = 0usize;
        let mut binary = false;
        let mut vertex_props = 0usize;
        let mut in_vertex_element = false;

        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim() != "ply" {
            bail!("{} is not a PLY file", path.display());
        }

        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                bail!("unterminated PLY header in {}", path.display());
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                ["format", "ascii", ..] => binary = false,
                ["format", "binary_little_endian", ..] => binary = true,
                ["format", other, ..] => bail!("unsupported PLY format: {}", other),
                ["element", "vertex", n] => {
                    num_vertices = n.parse()?;
                    in_vertex_element = true;
                }
                ["element", "face", n] => {
                    num_faces = n.parse()?;
                    in_vertex_element = false;
                }
                ["element", ..] => in_vertex_element = false,
                ["property", ..] if in_vertex_element => vertex_props += 1,
                ["end_header"] => break,
                _ => {}
            }
        }

        if vertex_props < 3 {
            bail!("PLY vertices need at least x y z properties");
        }

        let mut vertices = Vec::with_capacity(num_vertices);
        let mut triangles = Vec::with_capacity(num_faces);

        if binary {
            // Properties are assumed to be f32 each, faces u8-counted u32
            // indices, matching what the geometry mapper writes.
            let mut buf = vec![0u8; 4 * vertex_props];
            for _ in 0..num_vertices {
                reader.read_exact(&mut buf)?;
                let x = f32::from_le_bytes(buf[0..4].try_into().unwrap());
                let y = f32::from_le_bytes(buf[4..8].try_into().unwrap());
                let z = f32::from_le_bytes(buf[8..12].try_into().unwrap());
                vertices.push(Pt3::new(x as Real, y as Real, z as Real));
            }
            for _ in 0..num_faces {
                let mut count = [0u8; 1];
                reader.read_exact(&mut count)?;
                if count[0] != 3 {
                    bail!("only triangle faces are supported, got {}-gon", count[0]);
                }
                let mut idx = [0u8; 12];
                reader.read_exact(&mut idx)?;
                triangles.push([
                    u32::from_le_bytes(idx[0..4].try_into().unwrap()),
                    u32::from_le_bytes(idx[4..8].try_into().unwrap()),
                    u32::from_le_bytes(idx[8..12].try_into().unwrap()),
                ]);
            }
        } else {
            for _ in 0..num_vertices {
                line.clear();
                reader.read_line(&mut line)?;
                let vals: Vec<Real> = line
                    .split_whitespace()
                    .take(3)
                    .map(|t| t.parse::<Real>())
                    .collect::<Result<_, _>>()?;
                if vals.len() < 3 {
                    bail!("short PLY vertex line: {}", line.trim());
                }
                vertices.push(Pt3::new(vals[0], vals[1], vals[2]));
            }
            for _ in 0..num_faces {
                line.clear();
                reader.read_line(&mut line)?;
                let vals: Vec<usize> = line
                    .split_whitespace()
                    .map(|t| t.parse::<usize>())
                    .collect::<Result<_, _>>()?;
                if vals.len() < 4 || vals[0] != 3 {
                    bail!("only triangle faces are supported: {}", line.trim());
                }
                triangles.push([vals[1] as u32, vals[2] as u32, vals[3] as u32]);
            }
        }

        Self::new(vertices, triangles)
    }
}

impl MeshOracle for TriangleMesh {
    fn intersect_ray(
        &self,
        origin: &Pt3,
        dir: &Vec3,
        min_dist: Real,
        max_dist: Real,
    ) -> Option<Pt3> {
        let inv_dir = Vec3::new(1.0 / dir.x, 1.0 / dir.y, 1.0 / dir.z);
        let mut best: Option<Real> = None;
        let mut stack = vec![0usize];

        while let Some(node_idx) = stack.pop() {
            let limit = best.unwrap_or(max_dist);
            match &self.nodes[node_idx] {
                BvhNode::Inner { bounds, left, right } => {
                    if bounds.hit(origin, &inv_dir, min_dist, limit) {
                        stack.push(*left);
                        stack.push(*right);
                    }
                }
                BvhNode::Leaf {
                    bounds,
                    start,
                    count,
                } => {
                    if !bounds.hit(origin, &inv_dir, min_dist, limit) {
                        continue;
                    }
                    for &tri in &self.order[*start..*start + *count] {
                        if let Some(t) = self.intersect_triangle(tri, origin, dir) {
                            if t >= min_dist && t <= limit && best.map_or(true, |b| t < b) {
                                best = Some(t);
                            }
                        }
                    }
                }
            }
        }

        best.map(|t| origin + dir * t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two triangles forming the unit square in the z = 2 plane.
    fn square_mesh() -> TriangleMesh {
        let vertices = vec![
            Pt3::new(0.0, 0.0, 2.0),
            Pt3::new(1.0, 0.0, 2.0),
            Pt3::new(1.0, 1.0, 2.0),
            Pt3::new(0.0, 1.0, 2.0),
        ];
        let triangles = vec![[0, 1, 2], [0, 2, 3]];
        TriangleMesh::new(vertices, triangles).unwrap()
    }

    #[test]
    fn ray_hits_the_plane() {
        let mesh = square_mesh();
        let hit = mesh
            .intersect_ray(&Pt3::new(0.3, 0.4, 0.0), &Vec3::z(), 0.0, 10.0)
            .unwrap();
        assert!((hit - Pt3::new(0.3, 0.4, 2.0)).norm() < 1e-12);
    }

    #[test]
    fn distance_interval_is_respected() {
        let mesh = square_mesh();
        let origin = Pt3::new(0.5, 0.5, 0.0);
        assert!(mesh.intersect_ray(&origin, &Vec3::z(), 0.0, 1.0).is_none());
        assert!(mesh.intersect_ray(&origin, &Vec3::z(), 3.0, 10.0).is_none());
        assert!(mesh.intersect_ray(&origin, &Vec3::z(), 0.0, 5.0).is_some());
    }

    #[test]
    fn miss_returns_none() {
        let mesh = square_mesh();
        assert!(mesh
            .intersect_ray(&Pt3::new(2.0, 2.0, 0.0), &Vec3::z(), 0.0, 10.0)
            .is_none());
        assert!(mesh
            .intersect_ray(&Pt3::new(0.5, 0.5, 0.0), &(-Vec3::z()), 0.0, 10.0)
            .is_none());
    }

    #[test]
    fn nearest_of_two_layers_wins() {
        // Two parallel squares at z = 2 and z = 5.
        let mut vertices = square_mesh().vertices.clone();
        vertices.extend(
            square_mesh()
                .vertices
                .iter()
                .map(|p| Pt3::new(p.x, p.y, 5.0)),
        );
        let triangles = vec![[0, 1, 2], [0, 2, 3], [4, 5, 6], [4, 6, 7]];
        let mesh = TriangleMesh::new(vertices, triangles).unwrap();

        let hit = mesh
            .intersect_ray(&Pt3::new(0.5, 0.5, 0.0), &Vec3::z(), 0.0, 10.0)
            .unwrap();
        assert!((hit.z - 2.0).abs() < 1e-12);
    }

    #[test]
    fn large_mesh_bvh_matches_bruteforce() {
        // A grid of quads in the z = 1 plane.
        let n = 20usize;
        let mut vertices = Vec::new();
        for j in 0..=n {
            for i in 0..=n {
                vertices.push(Pt3::new(i as Real * 0.1, j as Real * 0.1, 1.0));
            }
        }
        let mut triangles = Vec::new();
        let at = |i: usize, j: usize| (j * (n + 1) + i) as u32;
        for j in 0..n {
            for i in 0..n {
                triangles.push([at(i, j), at(i + 1, j), at(i + 1, j + 1)]);
                triangles.push([at(i, j), at(i + 1, j + 1), at(i, j + 1)]);
            }
        }
        let mesh = TriangleMesh::new(vertices, triangles).unwrap();

        let hit = mesh
            .intersect_ray(&Pt3::new(0.73, 1.21, 0.0), &Vec3::z(), 0.0, 10.0)
            .unwrap();
        assert!((hit - Pt3::new(0.73, 1.21, 1.0)).norm() < 1e-12);
    }

    #[test]
    fn ascii_ply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.ply");
        fs::write(
            &path,
            "ply\n\
             format ascii 1.0\n\
             element vertex 3\n\
             property float x\n\
             property float y\n\
             property float z\n\
             element face 1\n\
             property list uchar int vertex_indices\n\
             end_header\n\
             0 0 1\n\
             1 0 1\n\
             0 1 1\n\
             3 0 1 2\n",
        )
        .unwrap();
        let mesh = TriangleMesh::load_ply(&path).unwrap();
        assert_eq!(mesh.num_triangles(), 1);
        let hit = mesh
            .intersect_ray(&Pt3::new(0.2, 0.2, 0.0), &Vec3::z(), 0.0, 5.0)
            .unwrap();
        assert!((hit.z - 1.0).abs() < 1e-12);
    }
}
