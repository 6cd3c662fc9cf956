//! Orchestrator (spec §4.7): "process one image" — download, unpack,
//! activate, end to end, with the safeguard layer wrapped around the whole
//! sequence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use blockdev::{BlockDeviceManager, PoolManager};
use durable_store::DurableStore;
use fsm_runtime::{FsmStore, QueueRegistry, StartOptions};
use pipeline_api::constants::{queue, DOWNLOAD_TIMEOUT_SECS, EXTRACT_TIMEOUT_SECS, OPERATION_GUARD_DEFAULT_PERMITS};
use pipeline_api::error::{ManagerError, ReportError};
use pipeline_api::model::ids;
use safeguard::{health_check, OperationGuard, ProcessLock};
use sysutils::health_sample;

use crate::config::Config;
use crate::extractor::Extractor;
use crate::fsms::activate::{self, ActivateRequest};
use crate::fsms::download::{self, DownloadRequest};
use crate::fsms::unpack::{self, UnpackRequest};
use crate::object_store::ObjectStore;
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub image_id: String,
    pub snapshot_id: String,
    pub snapshot_name: String,
    pub device_path: String,
}

/// Everything the orchestrator needs constructed once per process:
/// the pool, the durable store, the block device manager, the three FSM
/// engines on their three concurrency-capped queues. Built by `setup`,
/// consumed by `process_image`.
pub struct Orchestrator {
    config: Config,
    pool: Arc<PoolManager>,
    store: Arc<DurableStore>,
    block_device: Arc<BlockDeviceManager>,
    download_engine: fsm_runtime::FsmEngine<DownloadRequest, download::DownloadResponse>,
    unpack_engine: fsm_runtime::FsmEngine<UnpackRequest, unpack::UnpackResponse>,
    activate_engine: fsm_runtime::FsmEngine<ActivateRequest, activate::ActivateResponse>,
}

impl Orchestrator {
    pub fn setup(
        config: Config,
        object_store: Arc<dyn ObjectStore>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self, ManagerError> {
        let pool = Arc::new(PoolManager::new(
            config.pool_name.clone(),
            config.pool_dir.clone(),
            config.pool_metadata_size_bytes,
            config.pool_data_size_bytes,
        ));

        // Pool must exist before a metadata-sync can be issued against it.
        pool.ensure_exists()?;
        pool.sync()?;
        health_check::run(&pool)?;

        let store = Arc::new(DurableStore::open(&config.datastore_path)?);
        let block_device = Arc::new(BlockDeviceManager::new());
        let guard = Arc::new(OperationGuard::new(pool.clone(), OPERATION_GUARD_DEFAULT_PERMITS));

        let fsm_db_path = config.fsm_dir.join("fsm.db");
        let fsm_store = Arc::new(FsmStore::open(&fsm_db_path).structured(
            pipeline_api::error::StoreError::Open {
                path: fsm_db_path.display().to_string(),
            },
        )?);

        let queues = QueueRegistry::new();
        queues.register(queue::DOWNLOAD, config.download_queue_cap);
        queues.register(queue::UNPACK, config.unpack_queue_cap);
        queues.register(queue::ACTIVATE, config.activate_queue_cap);

        let download_engine = download::build(
            store.clone(),
            object_store,
            extractor.clone(),
            config.download_dir.clone(),
            config.download_staleness_secs,
            pipeline_api::constants::MAX_DOWNLOAD_SIZE_BYTES,
            fsm_store.clone(),
            queues.clone(),
        );
        let unpack_engine = unpack::build(
            store.clone(),
            block_device.clone(),
            guard.clone(),
            extractor,
            config.mount_root.clone(),
            config.default_device_size_bytes,
            fsm_store.clone(),
            queues.clone(),
        );
        let activate_engine = activate::build(
            store.clone(),
            block_device.clone(),
            guard,
            config.default_device_size_bytes,
            fsm_store,
            queues,
        );

        Ok(Orchestrator {
            config,
            pool,
            store,
            block_device,
            download_engine,
            unpack_engine,
            activate_engine,
        })
    }

    /// Re-enters every in-progress run for all three actions; logged, never
    /// propagated (spec §4.7 step 5).
    pub async fn resume_all(&self) {
        self.download_engine.resume().await;
        self.unpack_engine.resume().await;
        self.activate_engine.resume().await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn process_image(
        &self,
        object_key: &str,
        bucket: &str,
        region: &str,
        correlation_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineResult, ManagerError> {
        let start = Instant::now();
        let process_lock = ProcessLock::acquire(&self.config.fsm_dir)?;

        let result = self.run_pipeline(object_key, bucket, region, correlation_id, progress).await;

        self.post_op_stabilise(result.is_err());
        drop(process_lock);

        progress.emit(ProgressEvent::AllDone {
            image_id: &ids::image_id(object_key),
            snapshot_id: result.as_ref().map(|r| r.snapshot_id.as_str()).unwrap_or(""),
            snapshot_name: result.as_ref().map(|r| r.snapshot_name.as_str()).unwrap_or(""),
            device_path: result.as_ref().map(|r| r.device_path.as_str()).unwrap_or(""),
            duration: start.elapsed(),
            err: result.as_ref().err().map(|e| e.to_string()).as_deref(),
        });

        result
    }

    async fn run_pipeline(
        &self,
        object_key: &str,
        bucket: &str,
        region: &str,
        correlation_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineResult, ManagerError> {
        let image_id = ids::image_id(object_key);

        progress.emit(ProgressEvent::PhaseStarted { phase: "download", total: None });
        let download_request = DownloadRequest {
            object_key: object_key.to_string(),
            image_id: image_id.clone(),
            bucket: bucket.to_string(),
            region: region.to_string(),
        };
        let run_id = self
            .download_engine
            .start(
                correlation_id,
                download_request,
                StartOptions::new().queue(queue::DOWNLOAD).timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS)),
            )
            .await?;
        let download = match self.download_engine.wait(run_id).await {
            Ok(r) => r,
            Err(e) => {
                progress.emit(ProgressEvent::Error { phase: "download", err: &e.to_string() });
                return Err(e);
            }
        };
        progress.emit(ProgressEvent::PhaseCompleted { phase: "download" });

        progress.emit(ProgressEvent::PhaseStarted { phase: "unpack", total: None });
        let unpack_request = UnpackRequest {
            image_id: image_id.clone(),
            local_path: download.local_path,
            checksum: download.checksum,
            pool_name: self.pool.pool_name().to_string(),
            device_size: None,
        };
        let run_id = self
            .unpack_engine
            .start(
                correlation_id,
                unpack_request,
                StartOptions::new().queue(queue::UNPACK).timeout(Duration::from_secs(EXTRACT_TIMEOUT_SECS)),
            )
            .await?;
        let unpack = match self.unpack_engine.wait(run_id).await {
            Ok(r) => r,
            Err(e) => {
                progress.emit(ProgressEvent::Error { phase: "unpack", err: &e.to_string() });
                return Err(e);
            }
        };
        progress.emit(ProgressEvent::PhaseCompleted { phase: "unpack" });

        progress.emit(ProgressEvent::PhaseStarted { phase: "activate", total: None });
        let activate_request = ActivateRequest {
            image_id: image_id.clone(),
            device_id: unpack.device_id,
            device_name: unpack.device_name,
            snapshot_name: None,
            pool_name: self.pool.pool_name().to_string(),
        };
        let run_id = self
            .activate_engine
            .start(correlation_id, activate_request, StartOptions::new().queue(queue::ACTIVATE))
            .await?;
        let activate = match self.activate_engine.wait(run_id).await {
            Ok(r) => r,
            Err(e) => {
                progress.emit(ProgressEvent::Error { phase: "activate", err: &e.to_string() });
                return Err(e);
            }
        };
        progress.emit(ProgressEvent::PhaseCompleted { phase: "activate" });

        Ok(PipelineResult {
            image_id,
            snapshot_id: activate.snapshot_id,
            snapshot_name: activate.snapshot_name,
            device_path: activate.device_path,
        })
    }

    /// Post-operation stabilisation (spec §4.4): a metadata-sync on every
    /// exit path, plus a diagnostic D-state scan when the run failed.
    fn post_op_stabilise(&self, failed: bool) {
        if let Err(e) = self.pool.sync() {
            log::warn!("post-op pool sync failed: {e}");
        }
        if failed {
            match health_sample::scan_d_state(pipeline_api::constants::D_STATE_BLOCKING_PATTERNS) {
                Ok(procs) if !procs.is_empty() => {
                    log::warn!("post-op diagnostic: {} D-state process(es) present after failure", procs.len());
                }
                Ok(_) => {}
                Err(e) => log::warn!("post-op D-state scan failed: {e}"),
            }
        }
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn block_device(&self) -> &Arc<BlockDeviceManager> {
        &self.block_device
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }
}
