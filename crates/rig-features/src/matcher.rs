//! Brute-force descriptor matching with the Lowe ratio test.

/// Default ratio between best and second-best match distances.
pub const DEFAULT_RATIO: f32 = 0.8;

/// Match `left` descriptors against `right` by nearest neighbour in L2,
/// keeping a match only when the best distance is below `ratio` times the
/// second best. Returns `(left_index, right_index)` pairs.
pub fn match_descriptors(
    left: &[Vec<f32>],
    right: &[Vec<f32>],
    ratio: f32,
) -> Vec<(usize, usize)> {
    if right.len() < 2 {
        return Vec::new();
    }

    let mut matches = Vec::new();
    for (li, ld) in left.iter().enumerate() {
        let mut best = f32::INFINITY;
        let mut second = f32::INFINITY;
        let mut best_ri = 0usize;
        for (ri, rd) in right.iter().enumerate() {
            let d = dist2(ld, rd);
            if d < best {
                second = best;
                best = d;
                best_ri = ri;
            } else if d < second {
                second = d;
            }
        }
        // Distances are squared, so the ratio applies squared too.
        if best < ratio * ratio * second {
            matches.push((li, best_ri));
        }
    }
    matches
}

fn dist2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "descriptor lengths must agree");
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}
