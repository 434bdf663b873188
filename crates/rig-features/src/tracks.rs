//! Transitive fusion of pairwise matches into tracks.
//!
//! Each `(cid, fid)` pair is a node and each pairwise match an edge; the
//! connected components are the tracks. A component where one image
//! contributes two different features is internally contradictory and is
//! dropped whole.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

/// A track: which feature observes this point in which image.
pub type Track = BTreeMap<usize, usize>;

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Fuse pairwise matches into tracks and drop conflicting ones.
///
/// Track enumeration depends only on the sorted iteration order of the
/// match map, so it is reproducible across runs and thread counts.
pub fn build_tracks(
    matches: &BTreeMap<(usize, usize), Vec<(usize, usize)>>,
) -> Result<Vec<Track>> {
    // Assign dense node ids in deterministic order.
    let mut node_ids = BTreeMap::<(usize, usize), usize>::new();
    for (&(ci, cj), pair) in matches {
        for &(fi, fj) in pair {
            let n = node_ids.len();
            node_ids.entry((ci, fi)).or_insert(n);
            let n = node_ids.len();
            node_ids.entry((cj, fj)).or_insert(n);
        }
    }

    let mut uf = UnionFind::new(node_ids.len());
    for (&(ci, cj), pair) in matches {
        for &(fi, fj) in pair {
            uf.union(node_ids[&(ci, fi)], node_ids[&(cj, fj)]);
        }
    }

    // Gather components, keyed by root, in node-id order.
    let mut components = BTreeMap::<usize, Vec<(usize, usize)>>::new();
    for (&(cid, fid), &id) in &node_ids {
        let root = uf.find(id);
        components.entry(root).or_default().push((cid, fid));
    }

    let mut tracks = Vec::new();
    for (_, nodes) in components {
        let mut track = Track::new();
        let mut conflict = false;
        for (cid, fid) in nodes {
            if let Some(&existing) = track.get(&cid) {
                if existing != fid {
                    conflict = true;
                    break;
                }
            }
            track.insert(cid, fid);
        }
        if !conflict && track.len() >= 2 {
            tracks.push(track);
        }
    }

    if tracks.is_empty() {
        bail!("No tracks left after filtering. Perhaps images are too dissimilar?");
    }

    Ok(tracks)
}
