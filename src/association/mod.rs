//! Feature association worker.
//!
//! Pulls one projected sweep at a time from the handoff channel, de-skews it
//! with the IMU ring, extracts edge and planar features, solves the
//! inter-sweep transform against the previous sweep's cached features and
//! accumulates the world pose.

mod correspondence;
mod deskew;
mod features;
mod solver;

use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use kiddo::KdTree;
use log::info;
use nalgebra::Matrix3;

use crate::config::AssociationConfig;
use crate::core::math::{accumulate_rotation, plugin_imu_rotation, quaternion_from_rpy};
use crate::core::types::{Point, PointCloud, SegInfo, Transform6};
use crate::imu::ImuRing;
use crate::pipeline::{AssociationOut, OdometryMessage, ProjectionOut};
use crate::preprocessing::VoxelGridFilter;

use correspondence::build_kdtree;
use deskew::SweepImu;
use features::Smoothness;

/// Feature floors below which the solve is skipped and the trees are not
/// rebuilt.
const CORNER_FLOOR: usize = 10;
const SURF_FLOOR: usize = 100;

/// Scan-to-scan odometry estimator.
///
/// Owns every per-sweep buffer so a steady-state cycle allocates nothing.
/// Driven either by [`FeatureAssociation::run`] on a worker thread or by
/// feeding sweeps directly through [`FeatureAssociation::process_sweep`].
pub struct FeatureAssociation {
    n_scan: usize,
    config: AssociationConfig,

    // Current sweep, moved in from the projector.
    segmented_cloud: PointCloud,
    outlier_cloud: PointCloud,
    seg_info: SegInfo,
    time_scan_cur: f64,

    // Extracted features.
    corner_sharp: PointCloud,
    corner_less_sharp: PointCloud,
    surf_flat: PointCloud,
    surf_less_flat: PointCloud,
    less_flat_scan: PointCloud,
    less_flat_scan_ds: PointCloud,
    downsize_filter: VoxelGridFilter,

    curvature: Vec<f32>,
    neighbor_picked: Vec<bool>,
    cloud_label: Vec<i32>,
    smoothness: Vec<Smoothness>,

    // Correspondence caches, refreshed every fifth solver iteration.
    search_corner_1: Vec<i32>,
    search_corner_2: Vec<i32>,
    search_surf_1: Vec<i32>,
    search_surf_2: Vec<i32>,
    search_surf_3: Vec<i32>,
    cloud_ori: PointCloud,
    coeff_sel: PointCloud,

    // Previous sweep's features and their spatial indices.
    corner_last: PointCloud,
    surf_last: PointCloud,
    kdtree_corner_last: KdTree<f32, 3>,
    kdtree_surf_last: KdTree<f32, 3>,

    sweep_imu: SweepImu,

    transform_cur: Transform6,
    transform_sum: Transform6,
    is_degenerate: bool,
    degeneracy_proj: Matrix3<f32>,

    system_inited: bool,
    cycle_count: usize,
    last_odometry: OdometryMessage,

    input: Receiver<Option<ProjectionOut>>,
    output: Sender<AssociationOut>,
    odometry_tx: Sender<OdometryMessage>,
    imu_ring: Arc<Mutex<ImuRing>>,
}

impl FeatureAssociation {
    /// Create an associator wired to its channels and the shared IMU ring.
    pub fn new(
        n_scan: usize,
        config: AssociationConfig,
        imu_ring: Arc<Mutex<ImuRing>>,
        input: Receiver<Option<ProjectionOut>>,
        output: Sender<AssociationOut>,
        odometry_tx: Sender<OdometryMessage>,
    ) -> Self {
        let voxel_leaf = config.voxel_leaf_size;
        Self {
            n_scan,
            config,
            segmented_cloud: PointCloud::new(),
            outlier_cloud: PointCloud::new(),
            seg_info: SegInfo::default(),
            time_scan_cur: 0.0,
            corner_sharp: PointCloud::new(),
            corner_less_sharp: PointCloud::new(),
            surf_flat: PointCloud::new(),
            surf_less_flat: PointCloud::new(),
            less_flat_scan: PointCloud::new(),
            less_flat_scan_ds: PointCloud::new(),
            downsize_filter: VoxelGridFilter::new(voxel_leaf),
            curvature: Vec::new(),
            neighbor_picked: Vec::new(),
            cloud_label: Vec::new(),
            smoothness: Vec::new(),
            search_corner_1: Vec::new(),
            search_corner_2: Vec::new(),
            search_surf_1: Vec::new(),
            search_surf_2: Vec::new(),
            search_surf_3: Vec::new(),
            cloud_ori: PointCloud::new(),
            coeff_sel: PointCloud::new(),
            corner_last: PointCloud::new(),
            surf_last: PointCloud::new(),
            kdtree_corner_last: KdTree::new(),
            kdtree_surf_last: KdTree::new(),
            sweep_imu: SweepImu::default(),
            transform_cur: Transform6::identity(),
            transform_sum: Transform6::identity(),
            is_degenerate: false,
            degeneracy_proj: Matrix3::identity(),
            system_inited: false,
            cycle_count: 0,
            last_odometry: OdometryMessage::default(),
            input,
            output,
            odometry_tx,
            imu_ring,
        }
    }

    /// Worker loop: block on the handoff channel until the shutdown
    /// sentinel (`None`) arrives or the channel disconnects.
    pub(crate) fn run(mut self) {
        info!("feature association worker started");
        loop {
            match self.input.recv() {
                Ok(Some(projection)) => {
                    let ring = Arc::clone(&self.imu_ring);
                    let Ok(guard) = ring.lock() else {
                        break;
                    };
                    self.process_sweep(projection, &guard);
                }
                Ok(None) | Err(_) => break,
            }
        }
        info!("feature association worker stopped");
    }

    /// Process one projected sweep synchronously.
    ///
    /// The IMU ring is borrowed for the whole sweep, mirroring the coarse
    /// mutex hold of the threaded path.
    pub fn process_sweep(&mut self, projection: ProjectionOut, ring: &ImuRing) {
        self.segmented_cloud = projection.segmented_cloud;
        self.outlier_cloud = projection.outlier_cloud;
        self.seg_info = projection.seg_info;
        self.time_scan_cur = projection.stamp;

        self.reset_feature_buffers();

        self.adjust_distortion(ring);
        self.calculate_smoothness();
        self.mark_occluded_points();
        self.extract_features();

        if !self.system_inited {
            self.initialize_references();
            return;
        }

        self.update_initial_guess();
        self.update_transformation();
        self.integrate_transformation();

        self.last_odometry = self.make_odometry();
        self.odometry_tx.send(self.last_odometry).ok();

        self.prepare_next_sweep();
    }

    fn reset_feature_buffers(&mut self) {
        let n = self.segmented_cloud.len();
        self.curvature.clear();
        self.curvature.resize(n, 0.0);
        self.neighbor_picked.clear();
        self.neighbor_picked.resize(n, false);
        self.cloud_label.clear();
        self.cloud_label.resize(n, 0);
        self.smoothness.clear();
        self.smoothness.resize(n, Smoothness::default());
    }

    /// First sweep: its features become the reference without solving.
    fn initialize_references(&mut self) {
        std::mem::swap(&mut self.corner_less_sharp, &mut self.corner_last);
        std::mem::swap(&mut self.surf_less_flat, &mut self.surf_last);

        self.kdtree_corner_last = build_kdtree(&self.corner_last);
        self.kdtree_surf_last = build_kdtree(&self.surf_last);

        // Seed the world attitude from the IMU's gravity-referenced pitch
        // and roll at sweep start.
        self.transform_sum.rx += self.sweep_imu.pitch_start;
        self.transform_sum.rz += self.sweep_imu.roll_start;

        self.system_inited = true;
        info!(
            "associator initialized with {} corners, {} surfs",
            self.corner_last.len(),
            self.surf_last.len()
        );
    }

    /// Prime the inter-sweep transform with the IMU rotation delta and the
    /// velocity-implied translation.
    fn update_initial_guess(&mut self) {
        let imu = &mut self.sweep_imu;
        imu.pitch_last = imu.pitch_cur;
        imu.yaw_last = imu.yaw_cur;
        imu.roll_last = imu.roll_cur;
        imu.shift_from_start = imu.shift_from_start_cur;
        imu.velo_from_start = imu.velo_from_start_cur;

        if imu.angular_from_start.x != 0.0
            || imu.angular_from_start.y != 0.0
            || imu.angular_from_start.z != 0.0
        {
            self.transform_cur.rx = -imu.angular_from_start.y;
            self.transform_cur.ry = -imu.angular_from_start.z;
            self.transform_cur.rz = -imu.angular_from_start.x;
        }

        if imu.velo_from_start.x != 0.0
            || imu.velo_from_start.y != 0.0
            || imu.velo_from_start.z != 0.0
        {
            self.transform_cur.tx -= imu.velo_from_start.x * self.config.scan_period;
            self.transform_cur.ty -= imu.velo_from_start.y * self.config.scan_period;
            self.transform_cur.tz -= imu.velo_from_start.z * self.config.scan_period;
        }
    }

    /// Fold the solved inter-sweep transform into the world pose and absorb
    /// the IMU attitude change across the sweep.
    fn integrate_transformation(&mut self) {
        let (rx, ry, rz) = accumulate_rotation(
            self.transform_sum.rx,
            self.transform_sum.ry,
            self.transform_sum.rz,
            -self.transform_cur.rx,
            -self.transform_cur.ry,
            -self.transform_cur.rz,
        );

        let imu = &self.sweep_imu;
        let x1 = rz.cos() * (self.transform_cur.tx - imu.shift_from_start.x)
            - rz.sin() * (self.transform_cur.ty - imu.shift_from_start.y);
        let y1 = rz.sin() * (self.transform_cur.tx - imu.shift_from_start.x)
            + rz.cos() * (self.transform_cur.ty - imu.shift_from_start.y);
        let z1 = self.transform_cur.tz - imu.shift_from_start.z;

        let x2 = x1;
        let y2 = rx.cos() * y1 - rx.sin() * z1;
        let z2 = rx.sin() * y1 + rx.cos() * z1;

        let tx = self.transform_sum.tx - (ry.cos() * x2 + ry.sin() * z2);
        let ty = self.transform_sum.ty - y2;
        let tz = self.transform_sum.tz - (-ry.sin() * x2 + ry.cos() * z2);

        let (rx, ry, rz) = plugin_imu_rotation(
            rx,
            ry,
            rz,
            imu.pitch_start,
            imu.yaw_start,
            imu.roll_start,
            imu.pitch_last,
            imu.yaw_last,
            imu.roll_last,
        );

        self.transform_sum = Transform6 {
            rx,
            ry,
            rz,
            tx,
            ty,
            tz,
        };
    }

    /// World pose as an odometry message in the camera-init frame.
    fn make_odometry(&self) -> OdometryMessage {
        let q = quaternion_from_rpy(
            self.transform_sum.rz,
            -self.transform_sum.rx,
            -self.transform_sum.ry,
        );
        OdometryMessage {
            stamp: self.time_scan_cur,
            orientation: [-q[1], -q[2], q[0], q[3]],
            position: [
                self.transform_sum.tx,
                self.transform_sum.ty,
                self.transform_sum.tz,
            ],
        }
    }

    /// Move this sweep's features into the reference slots for the next
    /// sweep and emit the mapping message at the configured sub-rate.
    fn prepare_next_sweep(&mut self) {
        self.sweep_imu.update_start_sin_cos();

        for i in 0..self.corner_less_sharp.len() {
            let p = self.transform_to_end(&self.corner_less_sharp.points[i]);
            self.corner_less_sharp.points[i] = p;
        }
        for i in 0..self.surf_less_flat.len() {
            let p = self.transform_to_end(&self.surf_less_flat.points[i]);
            self.surf_less_flat.points[i] = p;
        }

        std::mem::swap(&mut self.corner_less_sharp, &mut self.corner_last);
        std::mem::swap(&mut self.surf_less_flat, &mut self.surf_last);

        if self.corner_last.len() > CORNER_FLOOR && self.surf_last.len() > SURF_FLOOR {
            self.kdtree_corner_last = build_kdtree(&self.corner_last);
            self.kdtree_surf_last = build_kdtree(&self.surf_last);
        }

        // The outlier cloud bypasses de-skew; swap its axes here so the
        // mapper sees one consistent frame.
        for p in &mut self.outlier_cloud.points {
            *p = Point::new(p.y, p.z, p.x, p.intensity);
        }

        self.cycle_count += 1;
        if self.cycle_count == self.config.mapping_frequency_divider {
            self.cycle_count = 0;
            let out = AssociationOut {
                cloud_corner_last: self.corner_last.clone(),
                cloud_surf_last: self.surf_last.clone(),
                cloud_outlier_last: self.outlier_cloud.clone(),
                laser_odometry: self.last_odometry,
            };
            self.output.send(out).ok();
        }
    }

    /// Resize the correspondence caches for this sweep's feature counts.
    pub(crate) fn reset_search_caches(&mut self) {
        let sharp = self.corner_sharp.len();
        let flat = self.surf_flat.len();
        self.search_corner_1.clear();
        self.search_corner_1.resize(sharp, -1);
        self.search_corner_2.clear();
        self.search_corner_2.resize(sharp, -1);
        self.search_surf_1.clear();
        self.search_surf_1.resize(flat, -1);
        self.search_surf_2.clear();
        self.search_surf_2.resize(flat, -1);
        self.search_surf_3.clear();
        self.search_surf_3.resize(flat, -1);
    }

    /// Sharp corner features of the current sweep.
    pub fn corner_sharp(&self) -> &PointCloud {
        &self.corner_sharp
    }

    /// Less-sharp corner features of the current sweep.
    pub fn corner_less_sharp(&self) -> &PointCloud {
        &self.corner_less_sharp
    }

    /// Flat surface features of the current sweep.
    pub fn surf_flat(&self) -> &PointCloud {
        &self.surf_flat
    }

    /// Down-sampled less-flat surface features of the current sweep.
    pub fn surf_less_flat(&self) -> &PointCloud {
        &self.surf_less_flat
    }

    /// Reference corner features of the previous sweep.
    pub fn corner_last(&self) -> &PointCloud {
        &self.corner_last
    }

    /// Reference surface features of the previous sweep.
    pub fn surf_last(&self) -> &PointCloud {
        &self.surf_last
    }

    /// Accumulated world pose.
    pub fn transform_sum(&self) -> Transform6 {
        self.transform_sum
    }

    /// Current inter-sweep transform.
    pub fn transform_cur(&self) -> Transform6 {
        self.transform_cur
    }

    /// True if the last solve detected a degenerate direction.
    pub fn is_degenerate(&self) -> bool {
        self.is_degenerate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crossbeam_channel::unbounded;
    use nalgebra::Matrix3;

    fn test_association() -> FeatureAssociation {
        let (_input_tx, input_rx) = unbounded();
        let (output_tx, _output_rx) = unbounded();
        let (odom_tx, _odom_rx) = unbounded();
        let ring = Arc::new(Mutex::new(ImuRing::new(0.1)));
        FeatureAssociation::new(
            16,
            AssociationConfig::default(),
            ring,
            input_rx,
            output_tx,
            odom_tx,
        )
    }

    #[test]
    fn transform_round_trip_at_zero_motion() {
        let mut assoc = test_association();
        assoc.sweep_imu.update_start_sin_cos();
        let assoc = assoc;
        let p = Point::new(1.0, -2.0, 3.0, 7.05);
        let end = assoc.transform_to_end(&p);
        let back = assoc.transform_to_start(&end);
        assert_relative_eq!(back.x, p.x, epsilon = 1e-5);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-5);
        assert_relative_eq!(back.z, p.z, epsilon = 1e-5);
    }

    #[test]
    fn transform_to_end_truncates_intensity_to_ring() {
        let mut assoc = test_association();
        assoc.sweep_imu.update_start_sin_cos();
        let assoc = assoc;
        let p = Point::new(1.0, 2.0, 3.0, 9.073);
        let end = assoc.transform_to_end(&p);
        assert_relative_eq!(end.intensity, 9.0);
    }

    #[test]
    fn transform_to_start_scales_with_relative_time() {
        let mut assoc = test_association();
        assoc.transform_cur.tx = 0.5;
        // Point at the very start of the sweep: no correction.
        let p0 = Point::new(1.0, 0.0, 0.0, 3.0);
        let w0 = assoc.transform_to_start(&p0);
        assert_relative_eq!(w0.x, 1.0, epsilon = 1e-6);
        // Point at the end of the sweep: full correction.
        let p1 = Point::new(1.0, 0.0, 0.0, 3.0999);
        let w1 = assoc.transform_to_start(&p1);
        assert_relative_eq!(w1.x, 1.0 - 0.5 * 0.999, epsilon = 1e-3);
    }

    #[test]
    fn identity_odometry_message() {
        let assoc = test_association();
        let odom = assoc.make_odometry();
        assert_relative_eq!(odom.orientation[3], 1.0, epsilon = 1e-6);
        assert_relative_eq!(odom.orientation[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(odom.position[0], 0.0);
    }

    #[test]
    fn degeneracy_flags_weak_direction() {
        let mut assoc = test_association();
        let strong = Matrix3::from_diagonal(&nalgebra::Vector3::new(100.0, 80.0, 50.0));
        assoc.compute_degeneracy_projection(&strong);
        assert!(!assoc.is_degenerate());

        let weak = Matrix3::from_diagonal(&nalgebra::Vector3::new(100.0, 80.0, 1.0));
        assoc.compute_degeneracy_projection(&weak);
        assert!(assoc.is_degenerate());
    }

    #[test]
    fn degeneracy_projection_suppresses_weak_component() {
        let mut assoc = test_association();
        let weak = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, 80.0, 100.0));
        assoc.compute_degeneracy_projection(&weak);
        assert!(assoc.is_degenerate());

        // The weak direction is the x axis; a pure-x step is annihilated.
        let step = assoc.degeneracy_proj * nalgebra::Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(step.norm(), 0.0, epsilon = 1e-5);
    }
}
