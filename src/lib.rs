//! Real-time LiDAR odometry pipeline.
//!
//! Converts raw rotating-LiDAR sweeps plus an IMU hint into a segmented
//! structured point cloud and a six-degree-of-freedom ego-motion estimate
//! between consecutive sweeps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   pipeline/                         │  ← Assembly, threads, channels
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │          projection/          association/          │  ← Core algorithms
//! │   (range image, segmentation) (de-skew, features,   │
//! │                                correspondences, LM) │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │              imu/        preprocessing/             │  ← Sensor-side support
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation (types, math)
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Two stages run concurrently: the *projector* turns an unordered sweep
//! into a `ring x column` range image, labels ground, segments the rest by
//! angular coherence and emits a linearized segmented cloud. The
//! *associator*, on its own worker thread behind a single-slot channel,
//! de-skews that cloud with interpolated IMU state, extracts edge and planar
//! features, matches them against the previous sweep through k-d tree
//! lookups and a two-phase Gauss-Newton solve, and integrates the result
//! into a world pose.

// ============================================================================
// Layer 1: Foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Sensor-side support (depends on core)
// ============================================================================
pub mod imu;
pub mod preprocessing;

// ============================================================================
// Layer 3: Core algorithms (depends on core, imu, preprocessing)
// ============================================================================
pub mod association;
pub mod projection;

// ============================================================================
// Layer 4: Pipeline assembly (depends on all layers)
// ============================================================================
pub mod config;
pub mod pipeline;

// ============================================================================
// Convenience re-exports
// ============================================================================

pub use association::FeatureAssociation;
pub use config::{AssociationConfig, ProjectionConfig, IMU_QUE_LENGTH};
pub use core::types::{Point, PointCloud, SegInfo, Transform6};
pub use imu::{ImuRing, ImuSample};
pub use pipeline::{
    AssociationOut, AssociationThread, LidarOdometry, OdometryMessage, PipelineError,
    ProjectionOut,
};
pub use preprocessing::VoxelGridFilter;
pub use projection::RangeImageProjector;
