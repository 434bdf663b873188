//! Problem assembly: one IR from the current state, tracks, and options.
//!
//! Every inlier feature contributes a bracketed reprojection term; depth
//! and mesh terms join where measurements exist. The freezing policy is
//! applied here, when each parameter block is first created.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use nalgebra::DVector;
use rig_core::{Distortion, Iso3, Pt3, Real, Rig, REF_SENSOR_ID};
use rig_features::Track;
use rig_optim::{
    affine_to_dvec, iso3_to_dvec, Bound, BracketStamps, DistortionKind, FactorKind, FixedMask,
    ManifoldKind, ParamId, ProblemIR, ResidualBlock, RobustLoss,
};

use crate::config::RefinerConfig;
use crate::refine::RefinerState;
use crate::triangulate::InlierMask;
use crate::types::CameraImage;

/// Name and weight of one residual block, for statistics reporting.
#[derive(Debug, Clone)]
pub struct ResidualTag {
    pub name: String,
    pub scale: Real,
    pub dim: usize,
}

/// Everything assembly needs to see, borrowed from the pass controller.
pub struct AssembleInput<'a> {
    pub rig: &'a Rig,
    pub state: &'a RefinerState,
    pub cams: &'a [CameraImage],
    pub tracks: &'a [Track],
    pub keypoints: &'a [Vec<(f32, f32)>],
    pub xyz: &'a [Pt3],
    pub inliers: &'a InlierMask,
    /// Per-feature mesh hits, when a mesh is present.
    pub mesh_per_feature: Option<&'a [BTreeMap<usize, Pt3>]>,
    /// Per-track averaged mesh hits, when a mesh is present.
    pub mesh_per_track: Option<&'a [Option<Pt3>]>,
    pub config: &'a RefinerConfig,
}

/// The assembled problem: IR, initial values, and residual tags aligned
/// with the IR's residual blocks.
pub struct AssembledProblem {
    pub ir: ProblemIR,
    pub initial: HashMap<String, DVector<f64>>,
    pub tags: Vec<ResidualTag>,
}

/// Names for the parameter blocks. One place, so assembly and copy-back
/// cannot drift apart.
pub mod names {
    pub fn ref_pose(r: usize) -> String {
        format!("ref_pose/{r}")
    }
    pub fn cam_pose(cid: usize) -> String {
        format!("cam_pose/{cid}")
    }
    pub fn extr(s: usize) -> String {
        format!("extr/{s}")
    }
    pub fn xyz(pid: usize) -> String {
        format!("xyz/{pid}")
    }
    pub fn offset(s: usize) -> String {
        format!("offset/{s}")
    }
    pub fn focal(s: usize) -> String {
        format!("focal/{s}")
    }
    pub fn center(s: usize) -> String {
        format!("center/{s}")
    }
    pub fn dist(s: usize) -> String {
        format!("dist/{s}")
    }
    pub fn depth_to_image(s: usize) -> String {
        format!("depth2img/{s}")
    }
    pub fn depth_scale(s: usize) -> String {
        format!("depth_scale/{s}")
    }
    pub const IDENTITY: &str = "identity";
}

struct Builder<'a> {
    input: &'a AssembleInput<'a>,
    ir: ProblemIR,
    initial: HashMap<String, DVector<f64>>,
    ids: HashMap<String, ParamId>,
    tags: Vec<ResidualTag>,
}

impl<'a> Builder<'a> {
    fn block(
        &mut self,
        name: String,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
        bounds: Option<Vec<Bound>>,
        init: DVector<f64>,
    ) -> ParamId {
        if let Some(id) = self.ids.get(&name) {
            return *id;
        }
        let id = self
            .ir
            .add_param_block(name.clone(), dim, manifold, fixed, bounds);
        self.initial.insert(name.clone(), init);
        self.ids.insert(name, id);
        id
    }

    fn se3_block(&mut self, name: String, pose: &Iso3, float: bool) -> ParamId {
        let fixed = if float {
            FixedMask::all_free()
        } else {
            FixedMask::all_fixed(7)
        };
        self.block(name, 7, ManifoldKind::SE3, fixed, None, iso3_to_dvec(pose))
    }

    fn identity_block(&mut self) -> ParamId {
        self.se3_block(names::IDENTITY.to_string(), &Iso3::identity(), false)
    }

    fn scalar_block(&mut self, name: String, value: Real, float: bool) -> ParamId {
        let fixed = if float {
            FixedMask::all_free()
        } else {
            FixedMask::all_fixed(1)
        };
        self.block(
            name,
            1,
            ManifoldKind::Euclidean,
            fixed,
            None,
            DVector::from_row_slice(&[value]),
        )
    }

    /// Pose blocks and stamps of one observation, honoring the pose model.
    fn pose_blocks(&mut self, cid: usize) -> (ParamId, ParamId, BracketStamps) {
        let cam = &self.input.cams[cid];
        let cfg = self.input.config;
        let state = self.input.state;

        if cfg.no_extrinsics {
            // Each camera floats on its own; interpolation degenerates.
            let float = if cam.sensor_id == REF_SENSOR_ID {
                cfg.float_sparse_map
            } else {
                cfg.float_nonref_cameras
            };
            let beg = self.se3_block(
                names::cam_pose(cid),
                &state.world_to_cam[cid],
                float,
            );
            let end = self.identity_block();
            let stamps = BracketStamps {
                beg: cam.timestamp,
                end: cam.timestamp,
                cam: cam.timestamp,
            };
            return (beg, end, stamps);
        }

        let beg = self.se3_block(
            names::ref_pose(cam.beg_ref_index),
            &state.world_to_ref[cam.beg_ref_index],
            cfg.float_sparse_map,
        );
        // The right bracketing pose of a reference observation is a
        // placeholder that never floats.
        let end = if cam.sensor_id == REF_SENSOR_ID {
            self.identity_block()
        } else {
            self.se3_block(
                names::ref_pose(cam.end_ref_index),
                &state.world_to_ref[cam.end_ref_index],
                cfg.float_sparse_map,
            )
        };
        let stamps = BracketStamps {
            beg: state.ref_timestamps[cam.beg_ref_index],
            end: state.ref_timestamps[cam.end_ref_index],
            cam: cam.timestamp,
        };
        (beg, end, stamps)
    }

    fn extr_block(&mut self, sensor: usize) -> ParamId {
        let cfg = self.input.config;
        let name = &self.input.rig.sensor(sensor).name;
        let float = !cfg.no_extrinsics
            && sensor != REF_SENSOR_ID
            && cfg.extrinsics_to_float.contains(name);
        self.se3_block(names::extr(sensor), &self.input.state.extrinsics[sensor], float)
    }

    fn offset_block(&mut self, sensor: usize) -> ParamId {
        let cfg = self.input.config;
        let state = self.input.state;
        let float =
            cfg.float_timestamp_offsets && sensor != REF_SENSOR_ID && !cfg.no_extrinsics;
        let bounds = float.then(|| {
            vec![Bound {
                idx: 0,
                lower: state.min_timestamp_offset[sensor],
                upper: state.max_timestamp_offset[sensor],
            }]
        });
        let fixed = if float {
            FixedMask::all_free()
        } else {
            FixedMask::all_fixed(1)
        };
        self.block(
            names::offset(sensor),
            1,
            ManifoldKind::Euclidean,
            fixed,
            bounds,
            DVector::from_row_slice(&[state.offsets[sensor]]),
        )
    }

    fn intrinsics_blocks(&mut self, sensor: usize) -> (ParamId, ParamId, ParamId, DistortionKind) {
        let cfg = self.input.config;
        let state = self.input.state;
        let to_float = cfg.intrinsics_to_float_for(sensor);

        let focal = self.scalar_block(
            names::focal(sensor),
            state.focals[sensor],
            to_float.focal_length,
        );

        let center_fixed = if to_float.optical_center {
            FixedMask::all_free()
        } else {
            FixedMask::all_fixed(2)
        };
        let center = self.block(
            names::center(sensor),
            2,
            ManifoldKind::Euclidean,
            center_fixed,
            None,
            DVector::from_row_slice(&[state.centers[sensor].x, state.centers[sensor].y]),
        );

        let (kind, coeffs) = match &state.distortions[sensor] {
            Distortion::None => (DistortionKind::None, vec![0.0]),
            d @ Distortion::Fisheye { .. } => (DistortionKind::Fisheye, d.coeffs()),
            d @ Distortion::RadTan { .. } => (DistortionKind::RadTan, d.coeffs()),
        };
        // The placeholder coefficient of a distortion-free sensor never
        // floats.
        let dist_floats = to_float.distortion && kind != DistortionKind::None;
        let dist_fixed = if dist_floats {
            FixedMask::all_free()
        } else {
            FixedMask::all_fixed(coeffs.len())
        };
        let dist = self.block(
            names::dist(sensor),
            coeffs.len(),
            ManifoldKind::Euclidean,
            dist_fixed,
            None,
            DVector::from_row_slice(&coeffs),
        );

        (focal, center, dist, kind)
    }

    fn depth_blocks(&mut self, sensor: usize) -> (ParamId, ParamId) {
        let cfg = self.input.config;
        let state = self.input.state;

        let d2i = if cfg.affine_depth_to_image {
            let fixed = if cfg.float_depth_to_image {
                FixedMask::all_free()
            } else {
                FixedMask::all_fixed(12)
            };
            self.block(
                names::depth_to_image(sensor),
                12,
                ManifoldKind::Euclidean,
                fixed,
                None,
                affine_to_dvec(&state.depth_to_image[sensor]),
            )
        } else {
            self.se3_block(
                names::depth_to_image(sensor),
                &state.depth_to_image[sensor].to_iso(),
                cfg.float_depth_to_image,
            )
        };

        // With an affine transform the scale is implicit and stays frozen.
        let float_scale = cfg.float_scale && !cfg.affine_depth_to_image;
        let scale = self.scalar_block(
            names::depth_scale(sensor),
            state.depth_scales[sensor],
            float_scale,
        );
        (d2i, scale)
    }

    fn push_residual(&mut self, block: ResidualBlock, name: String, scale: Real) {
        self.tags.push(ResidualTag {
            name,
            scale,
            dim: block.factor.residual_dim(),
        });
        self.ir.add_residual_block(block);
    }
}

/// Assemble the joint problem for one pass.
pub fn assemble_problem(input: &AssembleInput<'_>) -> Result<AssembledProblem> {
    let cfg = input.config;
    let loss = RobustLoss::Cauchy {
        scale: cfg.robust_threshold,
    };

    let mut b = Builder {
        input,
        ir: ProblemIR::new(),
        initial: HashMap::new(),
        ids: HashMap::new(),
        tags: Vec::new(),
    };

    for (pid, track) in input.tracks.iter().enumerate() {
        let mut track_has_inliers = false;

        for (&cid, &fid) in track {
            if !input.inliers.is_inlier(pid, cid) {
                continue;
            }
            track_has_inliers = true;

            let cam = &input.cams[cid];
            let sensor = cam.sensor_id;
            let sensor_name = input.rig.sensor(sensor).name.clone();

            let (beg, end, stamps) = b.pose_blocks(cid);
            let extr = b.extr_block(sensor);
            let point = b.block(
                names::xyz(pid),
                3,
                ManifoldKind::Euclidean,
                FixedMask::all_free(),
                None,
                DVector::from_row_slice(&[
                    input.xyz[pid].x,
                    input.xyz[pid].y,
                    input.xyz[pid].z,
                ]),
            );
            let offset = b.offset_block(sensor);
            let (focal, center, dist, kind) = b.intrinsics_blocks(sensor);

            let (px, py) = input.keypoints[cid][fid];
            let pixel = [px as Real, py as Real];

            b.push_residual(
                ResidualBlock {
                    params: vec![beg, end, extr, point, offset, focal, center, dist],
                    loss,
                    factor: FactorKind::BracketedReproj {
                        pixel,
                        stamps,
                        distortion: kind,
                    },
                },
                format!("{sensor_name}_pix"),
                1.0,
            );

            // Depth terms need a valid measurement under this pixel.
            let depth_xyz = cam
                .depth_cloud
                .as_ref()
                .and_then(|cloud| cloud.value_at(pixel[0], pixel[1]));

            if let Some(depth_xyz) = depth_xyz {
                if cfg.depth_tri_weight > 0.0 {
                    let (d2i, scale) = b.depth_blocks(sensor);
                    b.push_residual(
                        ResidualBlock {
                            params: vec![beg, end, extr, d2i, scale, point, offset],
                            loss,
                            factor: FactorKind::BracketedDepthTri {
                                depth_xyz: [depth_xyz.x, depth_xyz.y, depth_xyz.z],
                                stamps,
                                weight: cfg.depth_tri_weight,
                                affine: cfg.affine_depth_to_image,
                            },
                        },
                        "depth_tri_m".to_string(),
                        cfg.depth_tri_weight,
                    );
                }

                let mesh_hit = input
                    .mesh_per_feature
                    .and_then(|hits| hits[pid].get(&cid).copied());
                if cfg.depth_mesh_weight > 0.0 {
                    if let Some(mesh_xyz) = mesh_hit {
                        let (d2i, scale) = b.depth_blocks(sensor);
                        b.push_residual(
                            ResidualBlock {
                                params: vec![beg, end, extr, d2i, scale, offset],
                                loss,
                                factor: FactorKind::BracketedDepthMesh {
                                    depth_xyz: [depth_xyz.x, depth_xyz.y, depth_xyz.z],
                                    mesh_xyz: [mesh_xyz.x, mesh_xyz.y, mesh_xyz.z],
                                    stamps,
                                    weight: cfg.depth_mesh_weight,
                                    affine: cfg.affine_depth_to_image,
                                },
                            },
                            "depth_mesh_m".to_string(),
                            cfg.depth_mesh_weight,
                        );
                    }
                }
            }
        }

        // One track-to-mesh term per track.
        if track_has_inliers && cfg.mesh_tri_weight > 0.0 {
            if let Some(avg) = input.mesh_per_track.and_then(|t| t[pid]) {
                let point = b
                    .ids
                    .get(&names::xyz(pid))
                    .copied()
                    .expect("xyz block exists for a track with inliers");
                b.push_residual(
                    ResidualBlock {
                        params: vec![point],
                        loss,
                        factor: FactorKind::PointPrior {
                            target: [avg.x, avg.y, avg.z],
                            weight: cfg.mesh_tri_weight,
                        },
                    },
                    "mesh_tri_m".to_string(),
                    cfg.mesh_tri_weight,
                );
            }
        }
    }

    b.ir.validate()?;
    Ok(AssembledProblem {
        ir: b.ir,
        initial: b.initial,
        tags: b.tags,
    })
}

/// Evaluate every residual of an assembled problem at the given values,
/// without robustification. Used for the before/after statistics and kept
/// in lockstep with the factor definitions.
pub fn eval_residuals(
    ir: &ProblemIR,
    values: &HashMap<String, DVector<f64>>,
) -> Vec<f64> {
    use rig_optim::factors;

    let mut out = Vec::new();
    for residual in &ir.residuals {
        let blocks: Vec<&DVector<f64>> = residual
            .params
            .iter()
            .map(|id| &values[&ir[*id].name])
            .collect();

        match &residual.factor {
            FactorKind::BracketedReproj {
                pixel,
                stamps,
                distortion,
            } => {
                let r = factors::bracketed_reproj_residual(
                    blocks[0].as_view(),
                    blocks[1].as_view(),
                    blocks[2].as_view(),
                    blocks[3].as_view(),
                    blocks[4].as_view(),
                    blocks[5].as_view(),
                    blocks[6].as_view(),
                    blocks[7].as_view(),
                    *pixel,
                    stamps,
                    *distortion,
                );
                out.extend(r.iter());
            }
            FactorKind::BracketedDepthTri {
                depth_xyz,
                stamps,
                weight,
                affine,
            } => {
                let r = factors::bracketed_depth_tri_residual(
                    blocks[0].as_view(),
                    blocks[1].as_view(),
                    blocks[2].as_view(),
                    blocks[3].as_view(),
                    blocks[4].as_view(),
                    blocks[5].as_view(),
                    blocks[6].as_view(),
                    *depth_xyz,
                    stamps,
                    *weight,
                    *affine,
                );
                out.extend(r.iter());
            }
            FactorKind::BracketedDepthMesh {
                depth_xyz,
                mesh_xyz,
                stamps,
                weight,
                affine,
            } => {
                let r = factors::bracketed_depth_mesh_residual(
                    blocks[0].as_view(),
                    blocks[1].as_view(),
                    blocks[2].as_view(),
                    blocks[3].as_view(),
                    blocks[4].as_view(),
                    blocks[5].as_view(),
                    *depth_xyz,
                    *mesh_xyz,
                    stamps,
                    *weight,
                    *affine,
                );
                out.extend(r.iter());
            }
            FactorKind::PointPrior { target, weight } => {
                let r = factors::point_prior_residual(blocks[0].as_view(), *target, *weight);
                out.extend(r.iter());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bracket::BracketOutput;
    use crate::ingest::{ImageRecord, SensorStreams};
    use image::GrayImage;
    use rig_core::{Affine3, ImageSize, Sensor, SensorParams, Vec2};
    use std::path::PathBuf;

    fn two_sensor_rig() -> Rig {
        let params = |f: Real| {
            SensorParams::new(
                Vec2::new(f, f),
                Vec2::new(320.0, 240.0),
                Distortion::Fisheye { w: 0.9 },
                ImageSize::new(640, 480),
                ImageSize::new(640, 480),
            )
            .unwrap()
        };
        Rig::new(
            vec![
                Sensor {
                    name: "nav_cam".into(),
                    params: params(600.0),
                    ref_to_sensor: Affine3::identity(),
                    depth_to_image: Affine3::identity(),
                    timestamp_offset: 0.0,
                },
                Sensor {
                    name: "sci_cam".into(),
                    params: params(610.0),
                    ref_to_sensor: Affine3::identity(),
                    depth_to_image: Affine3::identity(),
                    timestamp_offset: 0.0,
                },
            ],
            true,
        )
        .unwrap()
    }

    fn cam(sensor_id: usize, ts: Real, beg: usize, end: usize) -> CameraImage {
        CameraImage {
            sensor_id,
            timestamp: ts,
            ref_timestamp: ts,
            beg_ref_index: beg,
            end_ref_index: end,
            image: GrayImage::new(4, 4),
            image_path: PathBuf::from(format!("cam/{ts}.jpg")),
            depth_cloud: None,
            depth_timestamp: None,
            depth_path: None,
        }
    }

    fn fixture(config: RefinerConfig) -> (Rig, Vec<CameraImage>, RefinerState, RefinerConfig) {
        let rig = two_sensor_rig();
        let records: Vec<ImageRecord> = [0.0, 1.0]
            .iter()
            .map(|&t| ImageRecord {
                timestamp: t,
                path: PathBuf::from(format!("nav_cam/{t}.jpg")),
                image: GrayImage::new(4, 4),
                world_to_cam: Affine3::from_iso(&Iso3::translation(-t, 0.0, 0.0)),
            })
            .collect();
        let sci = vec![ImageRecord {
            timestamp: 0.5,
            path: PathBuf::from("sci_cam/0.5.jpg"),
            image: GrayImage::new(4, 4),
            world_to_cam: Affine3::identity(),
        }];
        let streams = SensorStreams::from_records(2, vec![records, sci], vec![Vec::new(); 2])
            .unwrap();
        let cams = vec![cam(0, 0.0, 0, 0), cam(1, 0.5, 0, 1), cam(0, 1.0, 1, 1)];
        let bracket = BracketOutput {
            cams: cams.clone(),
            min_timestamp_offset: vec![-0.5, -0.4],
            max_timestamp_offset: vec![0.5, 0.4],
        };
        let state = RefinerState::new(&rig, &streams, &cams, &bracket).unwrap();
        (rig, cams, state, config)
    }

    fn one_track_input<'a>(
        rig: &'a Rig,
        cams: &'a [CameraImage],
        state: &'a RefinerState,
        tracks: &'a [Track],
        keypoints: &'a [Vec<(f32, f32)>],
        xyz: &'a [Pt3],
        inliers: &'a InlierMask,
        config: &'a RefinerConfig,
    ) -> AssembleInput<'a> {
        AssembleInput {
            rig,
            state,
            cams,
            tracks,
            keypoints,
            xyz,
            inliers,
            mesh_per_feature: None,
            mesh_per_track: None,
            config,
        }
    }

    #[test]
    fn reprojection_blocks_follow_the_freezing_policy() {
        let (rig, cams, state, config) = fixture(RefinerConfig {
            float_timestamp_offsets: true,
            extrinsics_to_float: ["sci_cam".to_string()].into_iter().collect(),
            ..Default::default()
        });

        let tracks = vec![Track::from([(0usize, 0usize), (1usize, 0usize), (2usize, 0usize)])];
        let keypoints = vec![vec![(100.0, 100.0)], vec![(105.0, 95.0)], vec![(98.0, 102.0)]];
        let xyz = vec![Pt3::new(0.0, 0.0, 4.0)];
        let inliers = InlierMask::new(&tracks);

        let assembled = assemble_problem(&one_track_input(
            &rig, &cams, &state, &tracks, &keypoints, &xyz, &inliers, &config,
        ))
        .unwrap();

        // Three reprojection residuals, one per observation.
        assert_eq!(assembled.ir.residuals.len(), 3);
        assert!(assembled.tags.iter().any(|t| t.name == "nav_cam_pix"));
        assert!(assembled.tags.iter().any(|t| t.name == "sci_cam_pix"));

        let block = |name: &str| {
            let id = assembled.ir.param_by_name(name).unwrap();
            &assembled.ir[id]
        };

        // Reference poses stay frozen without float_sparse_map.
        assert!(block(&names::ref_pose(0)).fixed.is_all_fixed(7));
        assert!(block(&names::ref_pose(1)).fixed.is_all_fixed(7));
        assert!(block(names::IDENTITY).fixed.is_all_fixed(7));

        // The reference extrinsic never floats; the sci one does here.
        assert!(block(&names::extr(0)).fixed.is_all_fixed(7));
        assert!(block(&names::extr(1)).fixed.is_empty());

        // The reference offset is pinned; the sci offset floats within the
        // bracketing bounds.
        assert!(block(&names::offset(0)).fixed.is_all_fixed(1));
        let sci_offset = block(&names::offset(1));
        assert!(sci_offset.fixed.is_empty());
        let bounds = sci_offset.bounds.as_ref().unwrap();
        assert_eq!(bounds[0].lower, -0.4);
        assert_eq!(bounds[0].upper, 0.4);

        // Points always float; intrinsics are frozen by default.
        assert!(block(&names::xyz(0)).fixed.is_empty());
        assert!(block(&names::focal(1)).fixed.is_all_fixed(1));
        assert!(block(&names::dist(1)).fixed.is_all_fixed(1));
    }

    #[test]
    fn depth_terms_join_only_with_valid_measurements() {
        let (rig, mut cams, state, config) = fixture(RefinerConfig {
            depth_tri_weight: 500.0,
            ..Default::default()
        });

        // A cloud with a single valid cell under the sci feature pixel.
        cams[1].depth_cloud = Some(rig_io::DepthCloud {
            rows: 480,
            cols: 640,
            points: {
                let mut pts = vec![[0.0f32; 3]; 640 * 480];
                pts[95 * 640 + 105] = [0.1, 0.2, 1.5];
                pts
            },
        });

        let tracks = vec![Track::from([(0usize, 0usize), (1usize, 0usize)])];
        let keypoints = vec![vec![(100.0, 100.0)], vec![(105.0, 95.0)]];
        let xyz = vec![Pt3::new(0.0, 0.0, 4.0)];
        let inliers = InlierMask::new(&tracks);

        let assembled = assemble_problem(&one_track_input(
            &rig, &cams, &state, &tracks, &keypoints, &xyz, &inliers, &config,
        ))
        .unwrap();

        // Two reprojection terms plus one depth term for the sci pixel.
        assert_eq!(assembled.ir.residuals.len(), 3);
        assert_eq!(
            assembled
                .tags
                .iter()
                .filter(|t| t.name == "depth_tri_m")
                .count(),
            1
        );
        // The depth blocks appeared; the scale stays frozen without
        // float_scale.
        assert!(assembled.ir.param_by_name(&names::depth_to_image(1)).is_some());
        let id = assembled.ir.param_by_name(&names::depth_scale(1)).unwrap();
        assert!(assembled.ir[id].fixed.is_all_fixed(1));
    }

    #[test]
    fn outliers_contribute_nothing() {
        let (rig, cams, state, config) = fixture(RefinerConfig::default());
        let tracks = vec![Track::from([(0usize, 0usize), (1usize, 0usize)])];
        let keypoints = vec![vec![(100.0, 100.0)], vec![(105.0, 95.0)]];
        let xyz = vec![Pt3::new(0.0, 0.0, 4.0)];
        let mut inliers = InlierMask::new(&tracks);
        inliers.mark_track_outlier(0);

        let assembled = assemble_problem(&one_track_input(
            &rig, &cams, &state, &tracks, &keypoints, &xyz, &inliers, &config,
        ))
        .unwrap();
        assert!(assembled.ir.residuals.is_empty());
        assert!(assembled.ir.params.is_empty());
    }

    #[test]
    fn no_extrinsics_swaps_in_per_camera_poses() {
        let (rig, cams, state, config) = fixture(RefinerConfig {
            no_extrinsics: true,
            float_nonref_cameras: true,
            ..Default::default()
        });

        let tracks = vec![Track::from([(0usize, 0usize), (1usize, 0usize)])];
        let keypoints = vec![vec![(100.0, 100.0)], vec![(105.0, 95.0)]];
        let xyz = vec![Pt3::new(0.0, 0.0, 4.0)];
        let inliers = InlierMask::new(&tracks);

        let assembled = assemble_problem(&one_track_input(
            &rig, &cams, &state, &tracks, &keypoints, &xyz, &inliers, &config,
        ))
        .unwrap();

        // Per-camera pose blocks instead of reference poses.
        assert!(assembled.ir.param_by_name(&names::cam_pose(0)).is_some());
        assert!(assembled.ir.param_by_name(&names::cam_pose(1)).is_some());
        assert!(assembled.ir.param_by_name(&names::ref_pose(0)).is_none());

        // The reference camera stays put, the other floats.
        let nav = assembled.ir.param_by_name(&names::cam_pose(0)).unwrap();
        let sci = assembled.ir.param_by_name(&names::cam_pose(1)).unwrap();
        assert!(assembled.ir[nav].fixed.is_all_fixed(7));
        assert!(assembled.ir[sci].fixed.is_empty());
    }
}
