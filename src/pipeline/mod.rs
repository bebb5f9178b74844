//! Two-stage pipeline assembly.
//!
//! The projector runs on the caller's thread (typically the sensor
//! callback); the associator runs on its own worker, connected by a
//! single-slot bounded channel so one sweep can be matched while the next is
//! being segmented. Sending `None` through the handoff is the cooperative
//! shutdown signal.

mod messages;

pub use messages::{AssociationOut, OdometryMessage, ProjectionOut};

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::info;
use thiserror::Error;

use crate::association::FeatureAssociation;
use crate::config::{AssociationConfig, ProjectionConfig};
use crate::core::types::Point;
use crate::imu::{ImuRing, ImuSample};
use crate::projection::RangeImageProjector;

/// Errors surfaced by the pipeline front end.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The association worker is gone and the handoff channel is closed.
    #[error("association worker disconnected")]
    WorkerDisconnected,
    /// Joining the worker thread failed because it panicked.
    #[error("association worker panicked")]
    WorkerPanicked,
}

/// Handle of the association worker thread.
pub struct AssociationThread {
    handle: JoinHandle<()>,
}

impl AssociationThread {
    /// Spawn the worker; it blocks on the handoff channel until shutdown.
    pub fn spawn(association: FeatureAssociation) -> Self {
        let handle = thread::Builder::new()
            .name("feature-association".into())
            .spawn(move || association.run())
            .expect("failed to spawn feature association thread");
        Self { handle }
    }

    /// Wait for the worker to exit.
    pub fn join(self) -> Result<(), PipelineError> {
        self.handle.join().map_err(|_| PipelineError::WorkerPanicked)
    }
}

/// Front object of the LiDAR odometry pipeline.
///
/// Feed raw sweeps with [`push_scan`](LidarOdometry::push_scan) and inertial
/// samples with [`push_imu`](LidarOdometry::push_imu); consume pose updates
/// from [`odometry`](LidarOdometry::odometry) and the down-rated mapping
/// stream from [`mapping_output`](LidarOdometry::mapping_output).
pub struct LidarOdometry {
    projector: RangeImageProjector,
    imu_ring: Arc<Mutex<ImuRing>>,
    handoff_tx: Sender<Option<ProjectionOut>>,
    odometry_rx: Receiver<OdometryMessage>,
    mapping_rx: Receiver<AssociationOut>,
    worker: Option<AssociationThread>,
}

impl LidarOdometry {
    /// Build the pipeline and start the association worker.
    pub fn new(projection: ProjectionConfig, association: AssociationConfig) -> Self {
        let imu_ring = Arc::new(Mutex::new(ImuRing::new(association.scan_period)));

        // Single-slot handoff: the projector naturally backpressures when
        // the associator falls one sweep behind.
        let (handoff_tx, handoff_rx) = bounded(1);
        let (mapping_tx, mapping_rx) = bounded(1);
        let (odometry_tx, odometry_rx) = unbounded();

        let n_scan = projection.n_scan;
        let worker = AssociationThread::spawn(FeatureAssociation::new(
            n_scan,
            association,
            Arc::clone(&imu_ring),
            handoff_rx,
            mapping_tx,
            odometry_tx,
        ));

        info!("lidar odometry pipeline started ({n_scan} rings)");

        Self {
            projector: RangeImageProjector::new(projection),
            imu_ring,
            handoff_tx,
            odometry_rx,
            mapping_rx,
            worker: Some(worker),
        }
    }

    /// Project and segment one raw sweep, then hand it to the associator.
    ///
    /// Blocks while the associator is still busy with the previous sweep.
    pub fn push_scan(&mut self, cloud: &[Point], stamp: f64) -> Result<(), PipelineError> {
        let projection = self.projector.process(cloud, stamp);
        self.handoff_tx
            .send(Some(projection))
            .map_err(|_| PipelineError::WorkerDisconnected)
    }

    /// Ingest one inertial sample into the shared ring.
    pub fn push_imu(&self, sample: &ImuSample) {
        if let Ok(mut ring) = self.imu_ring.lock() {
            ring.push(sample);
        }
    }

    /// Per-sweep odometry stream.
    pub fn odometry(&self) -> Receiver<OdometryMessage> {
        self.odometry_rx.clone()
    }

    /// Mapping stream, one message every `mapping_frequency_divider` sweeps.
    pub fn mapping_output(&self) -> Receiver<AssociationOut> {
        self.mapping_rx.clone()
    }

    /// Send the shutdown sentinel and join the worker.
    ///
    /// No partial sweep is emitted: the worker finishes the sweep it holds,
    /// observes the sentinel and exits.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.handoff_tx.send(None).ok();
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

impl Drop for LidarOdometry {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.handoff_tx.send(None).ok();
            worker.join().ok();
        }
    }
}
