//! Bracketed pose interpolation across sensor clocks.
//!
//! A non-reference observation at time `t` (on its own clock) is bracketed
//! by the reference frames at `t_beg` and `t_end` (reference clock). The
//! world-to-sensor pose at the observation is obtained by interpolating the
//! two reference poses and composing with the extrinsic.

use anyhow::{ensure, Result};

use crate::math::{Iso3, Real};

/// Interpolate two rigid transforms at fraction `alpha` in `[0, 1]`:
/// rotation slerp, translation lerp.
pub fn interp_rigid(alpha: Real, beg: &Iso3, end: &Iso3) -> Iso3 {
    let rot = beg.rotation.slerp(&end.rotation, alpha);
    let trans = beg.translation.vector * (1.0 - alpha) + end.translation.vector * alpha;
    Iso3::from_parts(trans.into(), rot)
}

/// Interpolated world-to-camera transform for a bracketed observation.
///
/// When `beg_ref_stamp == end_ref_stamp` this is a reference-sensor (or
/// independently-posed) observation: `beg_world_to_ref` is returned
/// directly, and `end_world_to_ref` and `ref_to_cam` are ignored.
///
/// The interpolation fraction subtracts the two large timestamps from each
/// other before anything else; mixing the offset into either timestamp
/// first loses precision, as the stamps are seconds since epoch.
pub fn interp_world_to_cam(
    beg_world_to_ref: &Iso3,
    end_world_to_ref: &Iso3,
    ref_to_cam: &Iso3,
    beg_ref_stamp: Real,
    end_ref_stamp: Real,
    ref_to_cam_offset: Real,
    cam_stamp: Real,
) -> Result<Iso3> {
    if beg_ref_stamp == end_ref_stamp {
        return Ok(*beg_world_to_ref);
    }

    let alpha = ((cam_stamp - beg_ref_stamp) - ref_to_cam_offset) / (end_ref_stamp - beg_ref_stamp);
    ensure!(
        (0.0..=1.0).contains(&alpha),
        "out of bounds in interpolation: alpha = {}",
        alpha
    );

    let world_to_ref = interp_rigid(alpha, beg_world_to_ref, end_world_to_ref);
    Ok(ref_to_cam * world_to_ref)
}
