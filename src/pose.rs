use nalgebra::{DMatrix, Matrix3, Point2, SymmetricEigen, Vector3};

use crate::config::CameraIntrinsics;
use crate::detector::RawDetection;

/// 6DoF pose of a tag relative to the camera.
#[derive(Debug, Clone)]
pub struct TagPose {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

/// Roll/pitch/yaw in degrees, X-Y-Z decomposition of a rotation matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAngles {
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
}

impl EulerAngles {
    /// Pure function of the matrix. Gimbal lock (pitch near ±90°) is not
    /// special-cased: roll and yaw become coupled. NaN entries propagate.
    pub fn from_rotation(r: &Matrix3<f64>) -> Self {
        let roll = r[(2, 1)].atan2(r[(2, 2)]);
        let pitch = (-r[(2, 0)]).atan2((r[(2, 1)].powi(2) + r[(2, 2)].powi(2)).sqrt());
        let yaw = r[(1, 0)].atan2(r[(0, 0)]);
        Self {
            roll_deg: roll.to_degrees(),
            pitch_deg: pitch.to_degrees(),
            yaw_deg: yaw.to_degrees(),
        }
    }
}

/// A detection with its pose interpreted, bundled for rendering and logging.
#[derive(Debug, Clone)]
pub struct TagObservation {
    pub id: usize,
    pub center: [f64; 2],
    pub corners: [[f64; 2]; 4],
    pub pose: TagPose,
    pub euler: EulerAngles,
}

impl TagObservation {
    /// Estimates the pose of a raw detection. Returns `None` when the
    /// homography is degenerate; the tag is then dropped for this frame.
    pub fn interpret(
        raw: &RawDetection,
        tag_size: f64,
        intrinsics: &CameraIntrinsics,
    ) -> Option<Self> {
        let pose = estimate_pose(&raw.corners, tag_size, intrinsics)?;
        let euler = EulerAngles::from_rotation(&pose.rotation);
        Some(Self {
            id: raw.id,
            center: raw.center,
            corners: raw.corners,
            pose,
            euler,
        })
    }
}

/// Estimates a tag's 6DoF pose from its 4 image corners.
///
/// Solves a planar homography between the tag-local corner coordinates and
/// the normalized image coordinates, then decomposes it into a rotation and
/// translation. The corner order must match the detector's output order.
pub fn estimate_pose(
    corners: &[[f64; 2]; 4],
    tag_size: f64,
    k: &CameraIntrinsics,
) -> Option<TagPose> {
    // normalize image coordinates
    let image_points: Vec<Point2<f64>> = corners
        .iter()
        .map(|p| Point2::new((p[0] - k.cx) / k.fx, (p[1] - k.cy) / k.fy))
        .collect();

    // tag-relative model points, matching the detector's corner order
    let s = tag_size / 2.0;
    let model_points = [
        Point2::new(-s, -s),
        Point2::new(-s, s),
        Point2::new(s, s),
        Point2::new(s, -s),
    ];

    // solve the homography p ~ H * P
    let mut a_data = Vec::with_capacity(8 * 9);
    for i in 0..4 {
        let x = model_points[i].x;
        let y = model_points[i].y;
        let u = image_points[i].x;
        let v = image_points[i].y;

        a_data.extend_from_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u]);
        a_data.extend_from_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
    }

    let a = DMatrix::from_row_slice(8, 9, &a_data);

    // solve Ah = 0: eigenvector of A^T A with the smallest eigenvalue
    let ata = a.transpose() * &a;
    let eigen = SymmetricEigen::new(ata);

    let mut min_val = f64::MAX;
    let mut min_idx = 0;
    for (i, val) in eigen.eigenvalues.iter().enumerate() {
        if *val < min_val {
            min_val = *val;
            min_idx = i;
        }
    }

    let h_vec = eigen.eigenvectors.column(min_idx);
    let h = Matrix3::new(
        h_vec[0], h_vec[1], h_vec[2], h_vec[3], h_vec[4], h_vec[5], h_vec[6], h_vec[7], h_vec[8],
    );

    // H = [h1 h2 h3] with h1 ~ r1, h2 ~ r2, h3 ~ t and ||r1|| = ||r2|| = 1
    let norm_h1 = h.column(0).norm();
    let norm_h2 = h.column(1).norm();
    let scale = (norm_h1 + norm_h2) / 2.0;
    if scale.abs() < 1e-6 {
        return None;
    }

    let mut t = h.column(2) / scale;

    let r1 = h.column(0) / scale;
    let r2 = h.column(1) / scale;
    let r3 = r1.cross(&r2);

    // enforce orthogonality: closest rotation via SVD
    let r_raw = Matrix3::from_columns(&[r1, r2, r3]);
    let r_svd = r_raw.svd(true, true);
    let (Some(u), Some(v_t)) = (r_svd.u, r_svd.v_t) else {
        return None;
    };
    let mut rotation = u * v_t;

    if rotation.determinant() < 0.0 {
        rotation = -rotation;
    }

    // the tag must sit in front of the camera
    if t.z < 0.0 {
        t = -t;
        let c0 = -rotation.column(0);
        let c1 = -rotation.column(1);
        let c2 = rotation.column(2).into_owned();
        rotation = Matrix3::from_columns(&[c0, c1, c2]);
    }

    Some(TagPose {
        rotation,
        translation: t.into_owned(),
    })
}
