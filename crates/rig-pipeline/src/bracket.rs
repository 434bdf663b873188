//! The bracketer: admit one observation per sensor per reference gap.
//!
//! For each pair of consecutive reference frames (after shifting onto the
//! sensor's clock) the observation closest to the gap's midpoint is
//! admitted; staying central maximizes the slack left for floating the
//! timestamp offset later. The accumulated per-sensor `[min, max]` offset
//! range is exactly the set of offsets compatible with the chosen
//! bracketing.

use anyhow::{bail, Result};
use log::info;
use rig_core::{interp_world_to_cam, Iso3, Real, Rig, REF_SENSOR_ID};

use crate::config::RefinerConfig;
use crate::ingest::SensorStreams;
use crate::types::CameraImage;

/// Guard band subtracted from the offset bounds: timestamps are seconds
/// since epoch, so adding and subtracting them costs precision.
const OFFSET_BOUND_MARGIN: Real = 1.0e-5;

/// Bracketing output: the admitted observations (sorted by reference-clock
/// time) and the admissible offset range per sensor.
#[derive(Debug, Clone)]
pub struct BracketOutput {
    pub cams: Vec<CameraImage>,
    pub min_timestamp_offset: Vec<Real>,
    pub max_timestamp_offset: Vec<Real>,
}

/// Select and bracket the images to use.
pub fn bracket_images(
    rig: &Rig,
    streams: &SensorStreams,
    config: &RefinerConfig,
) -> Result<BracketOutput> {
    info!("looking up the images and bracketing the timestamps");

    let num_sensors = rig.num_sensors();
    let num_ref = streams.ref_timestamps.len();

    let mut cams: Vec<CameraImage> = Vec::new();
    let mut min_offset: Vec<Real> = vec![-1.0e+100; num_sensors];
    let mut max_offset: Vec<Real> = vec![1.0e+100; num_sensors];

    for beg_ref_it in 0..num_ref {
        // The last reference frame brackets against itself, which admits a
        // non-reference observation landing exactly on it.
        let mut end_ref_it = beg_ref_it + 1;
        let last_timestamp = end_ref_it == num_ref;
        if last_timestamp {
            end_ref_it = beg_ref_it;
        }

        for sensor_id in 0..num_sensors {
            let found = if sensor_id == REF_SENSOR_ID {
                lookup_ref_observation(streams, beg_ref_it)?
            } else {
                lookup_bracketed_observation(
                    rig,
                    streams,
                    config,
                    sensor_id,
                    beg_ref_it,
                    end_ref_it,
                    last_timestamp,
                )?
            };

            let Some(mut cam) = found else { continue };

            if !config.use_timestamp(sensor_id, cam.timestamp) {
                info!(
                    "for {} skipping timestamp: {}",
                    rig.sensor(sensor_id).name,
                    cam.timestamp
                );
                continue;
            }

            // Record how far the offset may drift before this observation
            // leaves its bracket. Only observations actually admitted may
            // narrow the range, so this runs after the whitelist check.
            if sensor_id != REF_SENSOR_ID {
                min_offset[sensor_id] = min_offset[sensor_id]
                    .max(cam.timestamp - streams.ref_timestamps[cam.end_ref_index]);
                max_offset[sensor_id] = max_offset[sensor_id]
                    .min(cam.timestamp - streams.ref_timestamps[cam.beg_ref_index]);
            }

            attach_nearest_depth(streams, config, &mut cam);
            cams.push(cam);
        }
    }

    // Require every sensor to have contributed something.
    let mut num_images = vec![0usize; num_sensors];
    for cam in &cams {
        num_images[cam.sensor_id] += 1;
    }
    let mut is_good = true;
    for (sensor_id, count) in num_images.iter().enumerate() {
        info!(
            "number of found images for camera {}: {}",
            rig.sensor(sensor_id).name,
            count
        );
        if *count == 0 {
            is_good = false;
        }
    }
    if !is_good {
        bail!("Could not bracket all images. Cannot continue.");
    }

    // Intersect with the a-priori allowed change and tighten against
    // round-off.
    info!("timestamp offset allowed ranges based on current bracketing:");
    for sensor_id in 0..num_sensors {
        if sensor_id == REF_SENSOR_ID {
            continue;
        }
        let current = rig.offset(sensor_id);
        min_offset[sensor_id] =
            min_offset[sensor_id].max(current - config.timestamp_offsets_max_change);
        max_offset[sensor_id] =
            max_offset[sensor_id].min(current + config.timestamp_offsets_max_change);
        min_offset[sensor_id] += OFFSET_BOUND_MARGIN;
        max_offset[sensor_id] -= OFFSET_BOUND_MARGIN;
        info!(
            "{}: [{}, {}]",
            rig.sensor(sensor_id).name,
            min_offset[sensor_id],
            max_offset[sensor_id]
        );
    }

    // Sort by reference-clock time so nearby images match against each
    // other. The bracketing indices keep pointing into the reference table,
    // which does not reorder.
    cams.sort_by(|a, b| a.ref_timestamp.total_cmp(&b.ref_timestamp));

    Ok(BracketOutput {
        cams,
        min_timestamp_offset: min_offset,
        max_timestamp_offset: max_offset,
    })
}

fn lookup_ref_observation(
    streams: &SensorStreams,
    ref_it: usize,
) -> Result<Option<CameraImage>> {
    let stamp = streams.ref_timestamps[ref_it];
    let stream = &streams.images[REF_SENSOR_ID];
    // The reference table came from this stream, so an exact hit must
    // exist.
    let idx = stream
        .binary_search_by(|r| r.timestamp.total_cmp(&stamp))
        .map_err(|_| anyhow::anyhow!("cannot look up camera at time {:.17}", stamp))?;
    let record = &stream[idx];
    Ok(Some(CameraImage {
        sensor_id: REF_SENSOR_ID,
        timestamp: stamp,
        ref_timestamp: stamp,
        beg_ref_index: ref_it,
        end_ref_index: ref_it,
        image: record.image.clone(),
        image_path: record.path.clone(),
        depth_cloud: None,
        depth_timestamp: None,
        depth_path: None,
    }))
}

fn lookup_bracketed_observation(
    rig: &Rig,
    streams: &SensorStreams,
    config: &RefinerConfig,
    sensor_id: usize,
    beg_ref_it: usize,
    end_ref_it: usize,
    last_timestamp: bool,
) -> Result<Option<CameraImage>> {
    let offset = rig.offset(sensor_id);
    let beg_timestamp = streams.ref_timestamps[beg_ref_it] + offset;
    let end_timestamp = streams.ref_timestamps[end_ref_it] + offset;

    if end_timestamp < beg_timestamp {
        bail!("Ref timestamps must be in strictly increasing order.");
    }
    if end_timestamp == beg_timestamp && !last_timestamp {
        bail!("Ref timestamps must be in strictly increasing order.");
    }
    if end_timestamp - beg_timestamp > config.bracket_len {
        return Ok(None); // must respect the bracket length
    }

    // All in-bracket candidates; pick the one closest to the midpoint.
    let stream = &streams.images[sensor_id];
    let lo = stream.partition_point(|r| r.timestamp < beg_timestamp);
    let hi = stream.partition_point(|r| r.timestamp <= end_timestamp);
    if lo == hi {
        return Ok(None); // bracketing failed
    }

    let mid_timestamp = (beg_timestamp + end_timestamp) / 2.0;
    let best = stream[lo..hi]
        .iter()
        .min_by(|a, b| {
            (a.timestamp - mid_timestamp)
                .abs()
                .total_cmp(&(b.timestamp - mid_timestamp).abs())
        })
        .expect("non-empty candidate range");

    Ok(Some(CameraImage {
        sensor_id,
        timestamp: best.timestamp,
        ref_timestamp: best.timestamp - offset,
        beg_ref_index: beg_ref_it,
        end_ref_index: end_ref_it,
        image: best.image.clone(),
        image_path: best.path.clone(),
        depth_cloud: None,
        depth_timestamp: None,
        depth_path: None,
    }))
}

/// Attach the depth cloud closest in time, within the configured window.
fn attach_nearest_depth(streams: &SensorStreams, config: &RefinerConfig, cam: &mut CameraImage) {
    let depths = &streams.depths[cam.sensor_id];
    if depths.is_empty() {
        return;
    }
    let best = depths
        .iter()
        .min_by(|a, b| {
            (a.timestamp - cam.timestamp)
                .abs()
                .total_cmp(&(b.timestamp - cam.timestamp).abs())
        })
        .expect("non-empty depth stream");
    if (best.timestamp - cam.timestamp).abs() > config.max_image_to_depth_timestamp_diff {
        return;
    }
    cam.depth_cloud = Some(best.cloud.clone());
    cam.depth_timestamp = Some(best.timestamp);
    cam.depth_path = Some(best.path.clone());
}

/// World-to-camera transforms for every observation from the current rig
/// state, interpolating the bracketing reference poses.
pub fn calc_world_to_cam(
    cams: &[CameraImage],
    world_to_ref: &[Iso3],
    ref_timestamps: &[Real],
    extrinsics: &[Iso3],
    offsets: &[Real],
) -> Result<Vec<Iso3>> {
    cams.iter()
        .map(|cam| {
            interp_world_to_cam(
                &world_to_ref[cam.beg_ref_index],
                &world_to_ref[cam.end_ref_index],
                &extrinsics[cam.sensor_id],
                ref_timestamps[cam.beg_ref_index],
                ref_timestamps[cam.end_ref_index],
                offsets[cam.sensor_id],
                cam.timestamp,
            )
        })
        .collect()
}

/// Derive each non-reference sensor's extrinsic from the image-list poses,
/// for rigs whose config marked the transforms unknown. The first
/// bracketed observation of the sensor supplies
/// `extr = pose_from_list · interp(world_to_ref)⁻¹`; the optimizer refines
/// it from there.
pub fn derive_extrinsics(
    rig: &Rig,
    streams: &SensorStreams,
    cams: &[CameraImage],
) -> Result<Vec<Iso3>> {
    let mut extrinsics = vec![Iso3::identity(); rig.num_sensors()];

    for sensor_id in 1..rig.num_sensors() {
        let Some(cam) = cams.iter().find(|c| c.sensor_id == sensor_id) else {
            continue;
        };
        let stream = &streams.images[sensor_id];
        let idx = stream
            .binary_search_by(|r| r.timestamp.total_cmp(&cam.timestamp))
            .map_err(|_| {
                anyhow::anyhow!(
                    "no image-list pose for sensor {} at time {:.17}",
                    sensor_id,
                    cam.timestamp
                )
            })?;
        let pose_from_list = stream[idx].world_to_cam.to_iso();

        let world_to_ref = interp_world_to_cam(
            &streams.world_to_ref[cam.beg_ref_index],
            &streams.world_to_ref[cam.end_ref_index],
            &Iso3::identity(),
            streams.ref_timestamps[cam.beg_ref_index],
            streams.ref_timestamps[cam.end_ref_index],
            rig.offset(sensor_id),
            cam.timestamp,
        )?;
        extrinsics[sensor_id] = pose_from_list * world_to_ref.inverse();
    }

    Ok(extrinsics)
}

/// Initial world-to-camera transforms: through the rig transforms when the
/// config carried them, else straight from the image-list poses.
pub fn initial_world_to_cam(
    rig: &Rig,
    streams: &SensorStreams,
    cams: &[CameraImage],
) -> Result<Vec<Iso3>> {
    if rig.have_rig_transforms() {
        let extrinsics: Vec<Iso3> = (0..rig.num_sensors()).map(|s| rig.extrinsic(s)).collect();
        let offsets: Vec<Real> = (0..rig.num_sensors()).map(|s| rig.offset(s)).collect();
        return calc_world_to_cam(
            cams,
            &streams.world_to_ref,
            &streams.ref_timestamps,
            &extrinsics,
            &offsets,
        );
    }

    // No rig transforms: each pose was read with its image.
    cams.iter()
        .map(|cam| {
            let stream = &streams.images[cam.sensor_id];
            let idx = stream
                .binary_search_by(|r| r.timestamp.total_cmp(&cam.timestamp))
                .map_err(|_| {
                    anyhow::anyhow!(
                        "no image-list pose for sensor {} at time {:.17}",
                        cam.sensor_id,
                        cam.timestamp
                    )
                })?;
            Ok(stream[idx].world_to_cam.to_iso())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ImageRecord;
    use image::GrayImage;
    use rig_core::{Affine3, Distortion, ImageSize, SensorParams, Vec2};
    use std::path::PathBuf;

    fn test_rig(offset: Real) -> Rig {
        let params = SensorParams::new(
            Vec2::new(600.0, 600.0),
            Vec2::new(320.0, 240.0),
            Distortion::None,
            ImageSize::new(640, 480),
            ImageSize::new(640, 480),
        )
        .unwrap();
        let nav = rig_core::Sensor {
            name: "nav_cam".into(),
            params: params.clone(),
            ref_to_sensor: Affine3::identity(),
            depth_to_image: Affine3::identity(),
            timestamp_offset: 0.0,
        };
        let sci = rig_core::Sensor {
            name: "sci_cam".into(),
            params,
            ref_to_sensor: Affine3::identity(),
            depth_to_image: Affine3::identity(),
            timestamp_offset: offset,
        };
        Rig::new(vec![nav, sci], true).unwrap()
    }

    fn record(ts: Real, sensor: &str) -> ImageRecord {
        ImageRecord {
            timestamp: ts,
            path: PathBuf::from(format!("{sensor}/{ts}.jpg")),
            image: GrayImage::new(4, 4),
            world_to_cam: Affine3::from_iso(&Iso3::translation(ts, 0.0, 0.0)),
        }
    }

    fn streams(ref_ts: &[Real], other_ts: &[Real]) -> SensorStreams {
        let images = vec![
            ref_ts.iter().map(|&t| record(t, "nav_cam")).collect(),
            other_ts.iter().map(|&t| record(t, "sci_cam")).collect(),
        ];
        SensorStreams::from_records(2, images, vec![Vec::new(); 2]).unwrap()
    }

    #[test]
    fn interior_timestamps_are_admitted_once_per_gap() {
        let rig = test_rig(0.0);
        let streams = streams(&[0.0, 1.0, 2.0, 3.0], &[0.5, 1.5, 2.5]);
        let config = RefinerConfig {
            bracket_len: 1.1,
            ..Default::default()
        };

        let out = bracket_images(&rig, &streams, &config).unwrap();
        let sci: Vec<&CameraImage> =
            out.cams.iter().filter(|c| c.sensor_id == 1).collect();
        assert_eq!(sci.len(), 3);
        assert_eq!(sci[0].timestamp, 0.5);
        assert_eq!(sci[1].timestamp, 1.5);
        assert_eq!(sci[2].timestamp, 2.5);
        assert_eq!(sci[0].beg_ref_index, 0);
        assert_eq!(sci[0].end_ref_index, 1);
    }

    #[test]
    fn bracket_containment_invariant_holds() {
        let rig = test_rig(0.1);
        let streams = streams(&[0.0, 1.0, 2.0], &[0.55, 1.65]);
        let config = RefinerConfig {
            bracket_len: 1.5,
            ..Default::default()
        };
        let out = bracket_images(&rig, &streams, &config).unwrap();
        for cam in out.cams.iter().filter(|c| c.sensor_id == 1) {
            let shifted = cam.timestamp - rig.offset(1);
            assert!(streams.ref_timestamps[cam.beg_ref_index] <= shifted);
            assert!(shifted <= streams.ref_timestamps[cam.end_ref_index]);
            assert_eq!(cam.ref_timestamp, shifted);
        }
    }

    #[test]
    fn starvation_aborts() {
        let rig = test_rig(0.0);
        let streams = streams(&[0.0, 1.0, 2.0], &[0.5, 1.5]);
        let config = RefinerConfig {
            bracket_len: 0.01,
            ..Default::default()
        };
        let err = bracket_images(&rig, &streams, &config).unwrap_err();
        assert!(err.to_string().contains("Could not bracket all images"));
    }

    #[test]
    fn midpoint_preference_picks_central_observation() {
        let rig = test_rig(0.0);
        // Three candidates inside the one gap; 0.52 is closest to 0.5.
        let streams = streams(&[0.0, 1.0], &[0.1, 0.52, 0.95]);
        let config = RefinerConfig {
            bracket_len: 1.1,
            ..Default::default()
        };
        let out = bracket_images(&rig, &streams, &config).unwrap();
        let sci: Vec<&CameraImage> = out.cams.iter().filter(|c| c.sensor_id == 1).collect();
        assert_eq!(sci.len(), 1);
        assert_eq!(sci[0].timestamp, 0.52);
    }

    #[test]
    fn offset_bounds_narrow_with_bracketing() {
        let rig = test_rig(0.0);
        let streams = streams(&[0.0, 1.0, 2.0], &[0.4, 1.6]);
        let config = RefinerConfig {
            bracket_len: 1.1,
            timestamp_offsets_max_change: 10.0,
            ..Default::default()
        };
        let out = bracket_images(&rig, &streams, &config).unwrap();
        // 0.4 in gap [0, 1] allows offsets in [-0.6, 0.4]; 1.6 in gap
        // [1, 2] allows [-0.4, 0.6]; the intersection is [-0.4, 0.4],
        // tightened by the round-off margin.
        assert!((out.min_timestamp_offset[1] - (-0.4 + OFFSET_BOUND_MARGIN)).abs() < 1e-12);
        assert!((out.max_timestamp_offset[1] - (0.4 - OFFSET_BOUND_MARGIN)).abs() < 1e-12);
    }

    #[test]
    fn whitelisted_out_timestamps_do_not_narrow_offset_bounds() {
        use std::collections::HashSet;

        let rig = test_rig(0.0);
        let streams = streams(&[0.0, 1.0, 2.0], &[0.4, 1.6]);
        // Only 1.6 is admitted; 0.4 is filtered out by the whitelist.
        let mut timestamps_to_use = vec![HashSet::new(), HashSet::new()];
        timestamps_to_use[1].insert(1.6f64.to_bits());
        let config = RefinerConfig {
            bracket_len: 1.1,
            timestamp_offsets_max_change: 10.0,
            timestamps_to_use,
            ..Default::default()
        };

        let out = bracket_images(&rig, &streams, &config).unwrap();
        let sci: Vec<&CameraImage> = out.cams.iter().filter(|c| c.sensor_id == 1).collect();
        assert_eq!(sci.len(), 1);
        assert_eq!(sci[0].timestamp, 1.6);

        // The bounds come from 1.6 in gap [1, 2] alone: [-0.4, 0.6]. Had
        // the skipped 0.4 counted, the upper bound would have shrunk to
        // 0.4.
        assert!((out.min_timestamp_offset[1] - (-0.4 + OFFSET_BOUND_MARGIN)).abs() < 1e-12);
        assert!((out.max_timestamp_offset[1] - (0.6 - OFFSET_BOUND_MARGIN)).abs() < 1e-12);
    }

    #[test]
    fn cams_are_sorted_by_ref_timestamp() {
        let rig = test_rig(0.0);
        let streams = streams(&[0.0, 1.0, 2.0], &[0.5, 1.5]);
        let config = RefinerConfig {
            bracket_len: 1.1,
            ..Default::default()
        };
        let out = bracket_images(&rig, &streams, &config).unwrap();
        for pair in out.cams.windows(2) {
            assert!(pair[0].ref_timestamp <= pair[1].ref_timestamp);
        }
    }
}
