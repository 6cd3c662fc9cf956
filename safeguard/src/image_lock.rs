//! Per-Image Lock (spec §4.4): thin wrapper over the durable store's
//! `image_locks` table. Prevents two concurrent unpack attempts of the same
//! image across FSM runs.

use std::sync::Arc;

use log::info;

use durable_store::DurableStore;
use pipeline_api::error::ManagerError;

pub struct ImageLock {
    store: Arc<DurableStore>,
    image_id: String,
}

impl ImageLock {
    /// Acquires the lock row for `image_id`, held by `holder`. Returns
    /// `SafeguardError::ImageLocked` if another holder already has it.
    pub fn acquire(store: Arc<DurableStore>, image_id: &str, holder: &str) -> Result<Self, ManagerError> {
        store.acquire_image_lock(image_id, holder)?;
        info!("image_locks: acquired '{image_id}' for '{holder}'");
        Ok(ImageLock {
            store,
            image_id: image_id.to_string(),
        })
    }

    /// Releases the lock. Safe to call more than once; idempotent.
    pub fn release(self) -> Result<(), ManagerError> {
        self.store.release_image_lock(&self.image_id)
    }
}

impl Drop for ImageLock {
    /// Best-effort release if the caller panicked before calling `release`
    /// explicitly; `release_image_lock` is idempotent so this never
    /// double-errors on the normal path.
    fn drop(&mut self) {
        if let Err(e) = self.store.release_image_lock(&self.image_id) {
            log::warn!("Failed to release image lock '{}' on drop: {e}", self.image_id);
        }
    }
}
