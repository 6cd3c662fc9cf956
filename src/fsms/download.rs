//! Download FSM (spec §4.6.1, action `download-image`): streams an object
//! to local disk, validates it, and records completion in the Durable
//! Store.

use std::path::PathBuf;
use std::sync::Arc;

use durable_store::{DurableStore, ReserveOutcome};
use fsm_runtime::{Builder, FsmContext, FsmEngine, QueueRegistry, Req, StepOutcome};
use pipeline_api::error::{ManagerError, PipelineError, ReportError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::extractor::Extractor;
use crate::object_store::{validate_object_key, ObjectStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub object_key: String,
    pub image_id: String,
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResponse {
    pub image_id: String,
    pub local_path: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub downloaded: bool,
}

#[allow(clippy::too_many_arguments)]
pub fn build(
    store: Arc<DurableStore>,
    object_store: Arc<dyn ObjectStore>,
    extractor: Arc<dyn Extractor>,
    local_dir: PathBuf,
    staleness_secs: i64,
    max_size_bytes: u64,
    fsm_store: Arc<fsm_runtime::FsmStore>,
    queues: QueueRegistry,
) -> FsmEngine<DownloadRequest, DownloadResponse> {
    let check_store = store.clone();
    let reserve_store = store.clone();
    let metadata_store = store;

    Builder::new(pipeline_api::constants::action::DOWNLOAD_IMAGE)
        .state("check-exists", move |_ctx: &FsmContext, req: &mut Req<DownloadRequest, DownloadResponse>| {
            if let Some(image) = check_store.check_image_downloaded(&req.request.object_key)? {
                if image.is_download_consistent() {
                    return Ok(StepOutcome::Handoff(DownloadResponse {
                        image_id: image.image_id,
                        local_path: image.local_path,
                        checksum: image.checksum.unwrap_or_default(),
                        size_bytes: image.size_bytes,
                        downloaded: false,
                    }));
                }
            }

            match reserve_store.reserve_download(&req.request.image_id, &req.request.object_key, staleness_secs)? {
                ReserveOutcome::Reserved => Ok(StepOutcome::Advance(DownloadResponse {
                    image_id: req.request.image_id.clone(),
                    local_path: String::new(),
                    checksum: String::new(),
                    size_bytes: 0,
                    downloaded: false,
                })),
                ReserveOutcome::AlreadyCompleted => {
                    let image = reserve_store
                        .check_image_downloaded(&req.request.object_key)?
                        .structured(PipelineError::TarValidation {
                            reason: "reserve reported AlreadyCompleted but no completed row found".to_string(),
                        })?;
                    Ok(StepOutcome::Handoff(DownloadResponse {
                        image_id: image.image_id,
                        local_path: image.local_path,
                        checksum: image.checksum.unwrap_or_default(),
                        size_bytes: image.size_bytes,
                        downloaded: false,
                    }))
                }
                ReserveOutcome::InProgress => {
                    Err(ManagerError::new(pipeline_api::error::StoreError::Busy))
                }
            }
        })
        .state("download", {
            let local_dir = local_dir.clone();
            move |_ctx: &FsmContext, req: &mut Req<DownloadRequest, DownloadResponse>| {
                validate_object_key(&req.request.object_key)?;

                let part_path = local_dir.join(format!("{}.tar.part", req.request.image_id));
                let final_path = local_dir.join(format!("{}.tar", req.request.image_id));
                std::fs::create_dir_all(&local_dir).structured(PipelineError::TarValidation {
                    reason: "failed to create download directory".to_string(),
                })?;

                let outcome = object_store.download(&req.request.object_key, &part_path, max_size_bytes);
                let outcome = match outcome {
                    Ok(o) => o,
                    Err(e) => {
                        let _ = std::fs::remove_file(&part_path);
                        return Err(e);
                    }
                };

                std::fs::rename(&part_path, &final_path).structured(PipelineError::TarValidation {
                    reason: "failed to finalize downloaded file".to_string(),
                })?;

                Ok(StepOutcome::Advance(DownloadResponse {
                    image_id: req.request.image_id.clone(),
                    local_path: final_path.display().to_string(),
                    checksum: outcome.checksum,
                    size_bytes: outcome.size_bytes,
                    downloaded: true,
                }))
            }
        })
        .state("validate", move |_ctx: &FsmContext, req: &mut Req<DownloadRequest, DownloadResponse>| {
            let response = req.response.clone().structured(PipelineError::TarValidation {
                reason: "missing response from download state".to_string(),
            })?;

            let path = std::path::Path::new(&response.local_path);
            let bytes = std::fs::read(path).structured(PipelineError::TarValidation {
                reason: "failed to re-open downloaded file for validation".to_string(),
            })?;
            let recomputed = format!("{:x}", Sha256::digest(&bytes));
            if recomputed != response.checksum {
                let _ = std::fs::remove_file(path);
                return Ok(StepOutcome::Abort(ManagerError::new(PipelineError::ChecksumMismatch)));
            }

            if let Err(e) = extractor.validate(path) {
                let _ = std::fs::remove_file(path);
                return Ok(StepOutcome::Abort(ManagerError::new(PipelineError::TarValidation {
                    reason: e.to_string(),
                })));
            }

            Ok(StepOutcome::Advance(response))
        })
        .state("store-metadata", move |_ctx: &FsmContext, req: &mut Req<DownloadRequest, DownloadResponse>| {
            let response = req.response.clone().structured(PipelineError::TarValidation {
                reason: "missing response from validate state".to_string(),
            })?;
            metadata_store.store_image_metadata(
                &response.image_id,
                &req.request.object_key,
                &response.local_path,
                &response.checksum,
                response.size_bytes,
            )?;
            Ok(StepOutcome::Advance(response))
        })
        .build(fsm_store, queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::FakeExtractor;
    use crate::object_store::FakeObjectStore;
    use fsm_runtime::StartOptions;

    fn image_id() -> String {
        pipeline_api::model::ids::image_id("images/node/5.tar")
    }

    #[tokio::test]
    async fn fresh_download_runs_through_all_states() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open_in_memory().unwrap());
        let bytes = b"hello tarball".to_vec();
        let checksum = format!("{:x}", Sha256::digest(&bytes));
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(FakeObjectStore::new().with_object("images/node/5.tar", bytes));
        let extractor: Arc<dyn Extractor> = Arc::new(FakeExtractor::new());
        let fsm_store = Arc::new(fsm_runtime::FsmStore::open_in_memory().unwrap());
        let queues = QueueRegistry::new();

        let engine = build(
            store,
            object_store,
            extractor,
            dir.path().to_path_buf(),
            3600,
            10 * 1024 * 1024,
            fsm_store,
            queues,
        );

        let run_id = engine
            .start(
                "corr-1",
                DownloadRequest {
                    object_key: "images/node/5.tar".to_string(),
                    image_id: image_id(),
                    bucket: "bkt".to_string(),
                    region: "us".to_string(),
                },
                StartOptions::new(),
            )
            .await
            .unwrap();

        let response = engine.wait(run_id).await.unwrap();
        assert!(response.downloaded);
        assert_eq!(response.checksum, checksum);
        assert!(std::path::Path::new(&response.local_path).is_file());
    }

    #[tokio::test]
    async fn repeat_download_handoffs_on_completed_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open_in_memory().unwrap());
        let bytes = b"hello tarball".to_vec();
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(FakeObjectStore::new().with_object("images/node/5.tar", bytes));
        let extractor: Arc<dyn Extractor> = Arc::new(FakeExtractor::new());
        let fsm_store = Arc::new(fsm_runtime::FsmStore::open_in_memory().unwrap());
        let queues = QueueRegistry::new();

        let engine = build(
            store,
            object_store,
            extractor,
            dir.path().to_path_buf(),
            3600,
            10 * 1024 * 1024,
            fsm_store,
            queues,
        );

        let request = DownloadRequest {
            object_key: "images/node/5.tar".to_string(),
            image_id: image_id(),
            bucket: "bkt".to_string(),
            region: "us".to_string(),
        };

        let run_id = engine.start("corr-1", request.clone(), StartOptions::new()).await.unwrap();
        let first = engine.wait(run_id).await.unwrap();
        assert!(first.downloaded);

        let run_id = engine.start("corr-2", request, StartOptions::new()).await.unwrap();
        let second = engine.wait(run_id).await.unwrap();
        assert!(!second.downloaded);
        assert_eq!(second.checksum, first.checksum);
    }
}
