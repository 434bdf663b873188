//! Residual evaluators for the bracketed camera model.
//!
//! Every evaluator is generic over [`nalgebra::RealField`] so the backend
//! can differentiate it with dual numbers. Observed data (pixels, depth
//! measurements, timestamps) stays `f64` and is lifted into `T` at the
//! boundary.

use nalgebra::{DVectorView, Quaternion, RealField, SVector, UnitQuaternion, Vector3};

use crate::ir::{BracketStamps, DistortionKind};

fn lift<T: RealField>(v: f64) -> T {
    T::from_f64(v).unwrap()
}

fn se3_parts<T: RealField>(v: DVectorView<'_, T>) -> (UnitQuaternion<T>, Vector3<T>) {
    debug_assert!(v.len() == 7, "SE3 block must have 7 params");
    let quat = Quaternion::new(v[3].clone(), v[0].clone(), v[1].clone(), v[2].clone());
    let rot = UnitQuaternion::from_quaternion(quat);
    let t = Vector3::new(v[4].clone(), v[5].clone(), v[6].clone());
    (rot, t)
}

/// Interpolated world-to-camera transform, as rotation and translation.
///
/// With `beg == end` stamps the beg pose is the camera pose and the end
/// and extrinsic blocks are ignored. The fraction subtracts the two large
/// timestamps from each other before the offset enters, to keep precision;
/// a fraction outside `[0, 1]` means the bracketer mis-assigned this
/// observation, which is unrecoverable.
fn interp_world_to_cam<T: RealField>(
    beg: DVectorView<'_, T>,
    end: DVectorView<'_, T>,
    extr: DVectorView<'_, T>,
    offset: T,
    stamps: &BracketStamps,
) -> (UnitQuaternion<T>, Vector3<T>) {
    let (beg_q, beg_t) = se3_parts(beg);
    if !stamps.bracketed() {
        return (beg_q, beg_t);
    }

    let (end_q, end_t) = se3_parts(end);
    let (extr_q, extr_t) = se3_parts(extr);

    let alpha = (lift::<T>(stamps.cam - stamps.beg) - offset)
        * lift::<T>(1.0 / (stamps.end - stamps.beg));
    if alpha < T::zero() || alpha > T::one() {
        panic!("Out of bounds in interpolation.");
    }

    let rot = beg_q
        .try_slerp(&end_q, alpha.clone(), lift(1e-12))
        .unwrap_or_else(|| {
            // Antipodal rotations; fall back to normalized lerp.
            let q = beg_q.into_inner().lerp(&end_q.into_inner(), alpha.clone());
            UnitQuaternion::from_quaternion(q)
        });
    let trans = beg_t * (T::one() - alpha.clone()) + end_t * alpha;

    // Compose with the extrinsic: world -> ref -> cam.
    let out_rot = extr_q.clone() * rot;
    let out_t = extr_q * trans + extr_t;
    (out_rot, out_t)
}

/// Apply lens distortion to normalized coordinates.
fn distort<T: RealField>(
    kind: DistortionKind,
    coeffs: DVectorView<'_, T>,
    x: T,
    y: T,
) -> (T, T) {
    match kind {
        DistortionKind::None => (x, y),
        DistortionKind::Fisheye => {
            let w = coeffs[0].clone();
            let two = lift::<T>(2.0);
            let tan_half = (w.clone() / two.clone()).tan();
            let ru2 = x.clone() * x.clone() + y.clone() * y.clone();
            let ru = ru2.sqrt();
            // Near the axis, use the limit of rd/ru; the value and the
            // derivative in w stay correct there.
            let scale = if ru > lift(1e-9) {
                (two * ru.clone() * tan_half).atan() / (w * ru)
            } else {
                two * tan_half / w
            };
            (x * scale.clone(), y * scale)
        }
        DistortionKind::RadTan => {
            debug_assert!(coeffs.len() == 4 || coeffs.len() == 5);
            let k1 = coeffs[0].clone();
            let k2 = coeffs[1].clone();
            let (k3, p1, p2) = if coeffs.len() == 5 {
                (coeffs[2].clone(), coeffs[3].clone(), coeffs[4].clone())
            } else {
                (T::zero(), coeffs[2].clone(), coeffs[3].clone())
            };

            let r2 = x.clone() * x.clone() + y.clone() * y.clone();
            let r4 = r2.clone() * r2.clone();
            let r6 = r4.clone() * r2.clone();
            let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;

            let two = lift::<T>(2.0);
            let xy = x.clone() * y.clone();
            let x_tan = two.clone() * p1.clone() * xy.clone()
                + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
            let y_tan = p1 * (r2 + two.clone() * y.clone() * y.clone()) + two * p2 * xy;

            (x.clone() * radial.clone() + x_tan, y * radial + y_tan)
        }
    }
}

/// Pixel reprojection through the bracketed camera model.
///
/// Parameter order: beg pose, end pose, extrinsic, world point, timestamp
/// offset, focal (scalar), optical center, distortion coefficients.
/// Residual: predicted − observed distorted pixel.
#[allow(clippy::too_many_arguments)]
pub fn bracketed_reproj_residual<T: RealField>(
    beg: DVectorView<'_, T>,
    end: DVectorView<'_, T>,
    extr: DVectorView<'_, T>,
    point: DVectorView<'_, T>,
    offset: DVectorView<'_, T>,
    focal: DVectorView<'_, T>,
    center: DVectorView<'_, T>,
    dist: DVectorView<'_, T>,
    pixel: [f64; 2],
    stamps: &BracketStamps,
    kind: DistortionKind,
) -> SVector<T, 2> {
    let (wc_q, wc_t) = interp_world_to_cam(beg, end, extr, offset[0].clone(), stamps);

    let x_world = Vector3::new(point[0].clone(), point[1].clone(), point[2].clone());
    let x_cam = wc_q.transform_vector(&x_world) + wc_t;

    let eps = lift::<T>(1e-12);
    let z = if x_cam.z.clone() > eps.clone() {
        x_cam.z.clone()
    } else {
        eps
    };
    let xn = x_cam.x.clone() / z.clone();
    let yn = x_cam.y.clone() / z;

    let (xd, yd) = distort(kind, dist, xn, yn);

    let f = focal[0].clone();
    let u = f.clone() * xd + center[0].clone();
    let v = f * yd + center[1].clone();

    SVector::<T, 2>::new(u - lift(pixel[0]), v - lift(pixel[1]))
}

/// Bring a depth measurement into world coordinates: depth cloud → image
/// frame (with the separated scale) → world through the inverse of the
/// interpolated world-to-camera transform.
fn depth_point_to_world<T: RealField>(
    wc_q: &UnitQuaternion<T>,
    wc_t: &Vector3<T>,
    depth_to_image: DVectorView<'_, T>,
    scale: T,
    affine: bool,
    depth_xyz: [f64; 3],
) -> Vector3<T> {
    let x = Vector3::new(
        lift::<T>(depth_xyz[0]),
        lift::<T>(depth_xyz[1]),
        lift::<T>(depth_xyz[2]),
    );

    let m_img = if affine {
        debug_assert!(depth_to_image.len() == 12);
        let lin = nalgebra::Matrix3::new(
            depth_to_image[0].clone(),
            depth_to_image[1].clone(),
            depth_to_image[2].clone(),
            depth_to_image[3].clone(),
            depth_to_image[4].clone(),
            depth_to_image[5].clone(),
            depth_to_image[6].clone(),
            depth_to_image[7].clone(),
            depth_to_image[8].clone(),
        );
        let t = Vector3::new(
            depth_to_image[9].clone(),
            depth_to_image[10].clone(),
            depth_to_image[11].clone(),
        );
        lin * x * scale + t
    } else {
        let (q, t) = se3_parts(depth_to_image);
        q.transform_vector(&x) * scale + t
    };

    wc_q.inverse_transform_vector(&(m_img - wc_t))
}

/// Depth-to-triangulation residual: `w · (X − M_world)`.
#[allow(clippy::too_many_arguments)]
pub fn bracketed_depth_tri_residual<T: RealField>(
    beg: DVectorView<'_, T>,
    end: DVectorView<'_, T>,
    extr: DVectorView<'_, T>,
    depth_to_image: DVectorView<'_, T>,
    scale: DVectorView<'_, T>,
    point: DVectorView<'_, T>,
    offset: DVectorView<'_, T>,
    depth_xyz: [f64; 3],
    stamps: &BracketStamps,
    weight: f64,
    affine: bool,
) -> SVector<T, 3> {
    let (wc_q, wc_t) = interp_world_to_cam(beg, end, extr, offset[0].clone(), stamps);
    let m_world = depth_point_to_world(
        &wc_q,
        &wc_t,
        depth_to_image,
        scale[0].clone(),
        affine,
        depth_xyz,
    );
    let w = lift::<T>(weight);
    SVector::<T, 3>::new(
        w.clone() * (point[0].clone() - m_world.x.clone()),
        w.clone() * (point[1].clone() - m_world.y.clone()),
        w * (point[2].clone() - m_world.z.clone()),
    )
}

/// Depth-to-mesh residual: `w · (mesh − M_world)`.
#[allow(clippy::too_many_arguments)]
pub fn bracketed_depth_mesh_residual<T: RealField>(
    beg: DVectorView<'_, T>,
    end: DVectorView<'_, T>,
    extr: DVectorView<'_, T>,
    depth_to_image: DVectorView<'_, T>,
    scale: DVectorView<'_, T>,
    offset: DVectorView<'_, T>,
    depth_xyz: [f64; 3],
    mesh_xyz: [f64; 3],
    stamps: &BracketStamps,
    weight: f64,
    affine: bool,
) -> SVector<T, 3> {
    let (wc_q, wc_t) = interp_world_to_cam(beg, end, extr, offset[0].clone(), stamps);
    let m_world = depth_point_to_world(
        &wc_q,
        &wc_t,
        depth_to_image,
        scale[0].clone(),
        affine,
        depth_xyz,
    );
    let w = lift::<T>(weight);
    SVector::<T, 3>::new(
        w.clone() * (lift::<T>(mesh_xyz[0]) - m_world.x.clone()),
        w.clone() * (lift::<T>(mesh_xyz[1]) - m_world.y.clone()),
        w * (lift::<T>(mesh_xyz[2]) - m_world.z.clone()),
    )
}

/// Point-to-target residual: `w · (target − X)`.
pub fn point_prior_residual<T: RealField>(
    point: DVectorView<'_, T>,
    target: [f64; 3],
    weight: f64,
) -> SVector<T, 3> {
    let w = lift::<T>(weight);
    SVector::<T, 3>::new(
        w.clone() * (lift::<T>(target[0]) - point[0].clone()),
        w.clone() * (lift::<T>(target[1]) - point[1].clone()),
        w * (lift::<T>(target[2]) - point[2].clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::iso3_to_dvec;
    use nalgebra::DVector;
    use nalgebra::Vector3 as V3;
    use rig_core::Iso3;

    fn pose(angle: f64, t: (f64, f64, f64)) -> Iso3 {
        let rot = nalgebra::UnitQuaternion::from_axis_angle(&V3::z_axis(), angle);
        Iso3::from_parts(V3::new(t.0, t.1, t.2).into(), rot)
    }

    fn stamps_mid() -> BracketStamps {
        BracketStamps {
            beg: 100.0,
            end: 101.0,
            cam: 100.5,
        }
    }

    #[test]
    fn reproj_residual_vanishes_at_ground_truth() {
        let beg = pose(0.0, (0.0, 0.0, 0.0));
        let end = pose(0.2, (0.4, 0.0, 0.0));
        let extr = pose(0.05, (0.1, -0.05, 0.0));
        let offset = 0.0;
        let stamps = stamps_mid();

        // Build the expected pixel with the f64 reference path.
        let world_to_cam = rig_core::interp_world_to_cam(
            &beg, &end, &extr, stamps.beg, stamps.end, offset, stamps.cam,
        )
        .unwrap();
        let x = V3::new(0.3, -0.2, 4.0);
        let pc = world_to_cam * nalgebra::Point3::from(x);

        let f = 600.0;
        let c = (320.0, 240.0);
        let coeffs = [-0.2, 0.05, 0.001, -0.002];
        let dist = rig_core::Distortion::from_coeffs("radtan", &coeffs).unwrap();
        let nd = dist.distort(&rig_core::Vec2::new(pc.x / pc.z, pc.y / pc.z));
        let pixel = [f * nd.x + c.0, f * nd.y + c.1];

        let r: SVector<f64, 2> = bracketed_reproj_residual(
            iso3_to_dvec(&beg).as_view(),
            iso3_to_dvec(&end).as_view(),
            iso3_to_dvec(&extr).as_view(),
            DVector::from_row_slice(&[x.x, x.y, x.z]).as_view(),
            DVector::from_row_slice(&[offset]).as_view(),
            DVector::from_row_slice(&[f]).as_view(),
            DVector::from_row_slice(&[c.0, c.1]).as_view(),
            DVector::from_row_slice(&coeffs).as_view(),
            pixel,
            &stamps,
            DistortionKind::RadTan,
        );
        assert!(r.norm() < 1e-9, "residual {}", r.norm());
    }

    #[test]
    fn unbracketed_observation_uses_beg_pose_only() {
        let beg = pose(0.1, (1.0, 0.0, 0.0));
        // Garbage end/extr blocks must not matter.
        let end = pose(2.0, (9.0, 9.0, 9.0));
        let extr = pose(-1.0, (5.0, 5.0, 5.0));
        let stamps = BracketStamps {
            beg: 100.0,
            end: 100.0,
            cam: 100.0,
        };

        let x = V3::new(0.0, 0.0, 3.0);
        let pc = beg * nalgebra::Point3::from(x);
        let pixel = [500.0 * pc.x / pc.z, 500.0 * pc.y / pc.z];

        let r: SVector<f64, 2> = bracketed_reproj_residual(
            iso3_to_dvec(&beg).as_view(),
            iso3_to_dvec(&end).as_view(),
            iso3_to_dvec(&extr).as_view(),
            DVector::from_row_slice(&[x.x, x.y, x.z]).as_view(),
            DVector::from_row_slice(&[0.0]).as_view(),
            DVector::from_row_slice(&[500.0]).as_view(),
            DVector::from_row_slice(&[0.0, 0.0]).as_view(),
            DVector::from_row_slice(&[0.0]).as_view(),
            pixel,
            &stamps,
            DistortionKind::None,
        );
        assert!(r.norm() < 1e-10);
    }

    #[test]
    #[should_panic(expected = "Out of bounds in interpolation")]
    fn out_of_bracket_fraction_panics() {
        let beg = pose(0.0, (0.0, 0.0, 0.0));
        let end = pose(0.0, (1.0, 0.0, 0.0));
        let stamps = BracketStamps {
            beg: 100.0,
            end: 101.0,
            cam: 102.0,
        };
        let _: SVector<f64, 2> = bracketed_reproj_residual(
            iso3_to_dvec(&beg).as_view(),
            iso3_to_dvec(&end).as_view(),
            iso3_to_dvec(&Iso3::identity()).as_view(),
            DVector::from_row_slice(&[0.0, 0.0, 5.0]).as_view(),
            DVector::from_row_slice(&[0.0]).as_view(),
            DVector::from_row_slice(&[500.0]).as_view(),
            DVector::from_row_slice(&[0.0, 0.0]).as_view(),
            DVector::from_row_slice(&[0.0]).as_view(),
            [0.0, 0.0],
            &stamps,
            DistortionKind::None,
        );
    }

    #[test]
    fn depth_residual_vanishes_for_consistent_measurement() {
        let cam = pose(0.3, (0.5, -0.2, 1.0));
        let stamps = BracketStamps {
            beg: 10.0,
            end: 10.0,
            cam: 10.0,
        };

        // Depth-to-image: small rotation with a scale of 1.002.
        let d2i = pose(0.01, (0.001, -0.002, 0.0005));
        let scale = 1.002;

        let depth_xyz = V3::new(0.2, 0.1, 1.5);
        let m_img = d2i.rotation.transform_vector(&depth_xyz) * scale + d2i.translation.vector;
        let m_world = cam.inverse_transform_point(&nalgebra::Point3::from(m_img));

        let weight = 1000.0;
        let r: SVector<f64, 3> = bracketed_depth_tri_residual(
            iso3_to_dvec(&cam).as_view(),
            iso3_to_dvec(&Iso3::identity()).as_view(),
            iso3_to_dvec(&Iso3::identity()).as_view(),
            iso3_to_dvec(&d2i).as_view(),
            DVector::from_row_slice(&[scale]).as_view(),
            DVector::from_row_slice(&[m_world.x, m_world.y, m_world.z]).as_view(),
            DVector::from_row_slice(&[0.0]).as_view(),
            [depth_xyz.x, depth_xyz.y, depth_xyz.z],
            &stamps,
            weight,
            false,
        );
        assert!(r.norm() < 1e-9, "residual {}", r.norm());
    }

    #[test]
    fn depth_mesh_residual_measures_mesh_disagreement() {
        let cam = Iso3::identity();
        let stamps = BracketStamps {
            beg: 10.0,
            end: 10.0,
            cam: 10.0,
        };
        let depth_xyz = [0.0, 0.0, 2.0];
        // Identity depth-to-image and camera: M_world = (0, 0, 2).
        let mesh = [0.0, 0.0, 2.5];

        let r: SVector<f64, 3> = bracketed_depth_mesh_residual(
            iso3_to_dvec(&cam).as_view(),
            iso3_to_dvec(&Iso3::identity()).as_view(),
            iso3_to_dvec(&Iso3::identity()).as_view(),
            iso3_to_dvec(&Iso3::identity()).as_view(),
            DVector::from_row_slice(&[1.0]).as_view(),
            DVector::from_row_slice(&[0.0]).as_view(),
            depth_xyz,
            mesh,
            &stamps,
            10.0,
            false,
        );
        assert!((r[0]).abs() < 1e-12);
        assert!((r[1]).abs() < 1e-12);
        assert!((r[2] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn point_prior_is_weighted_difference() {
        let r: SVector<f64, 3> = point_prior_residual(
            DVector::from_row_slice(&[1.0, 2.0, 3.0]).as_view(),
            [1.0, 2.0, 4.0],
            3.0,
        );
        assert_eq!(r, SVector::<f64, 3>::new(0.0, 0.0, 3.0));
    }
}
