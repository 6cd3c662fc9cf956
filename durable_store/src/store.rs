//! The Durable Store (spec §4.1): a local embedded SQL engine holding
//! `images`, `unpacked_images`, `snapshots`, `image_locks`. Grounded on the
//! teacher's `datastore.rs` (direct `sqlite` crate usage, upsert-by-prepare,
//! structured log line per write) generalized from a single `hoststatus`
//! blob to a proper relational schema per spec §3/§4.1.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use log::info;
use sqlite::Connection;

use pipeline_api::error::{ManagerError, ReportError, StoreError};
use pipeline_api::model::{ActivationStatus, DownloadStatus, Image, ImageLock, Snapshot, UnpackedImage};

use crate::migrations;

/// Busy-timeout applied to every statement (spec §4.1: "per-statement
/// busy-timeout").
const BUSY_TIMEOUT_MS: i32 = 5_000;

pub struct DurableStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    AlreadyCompleted,
    InProgress,
}

impl DurableStore {
    pub fn open(path: &Path) -> Result<Self, ManagerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create durable store directory")
                .structured(StoreError::Open {
                    path: path.display().to_string(),
                })?;
        }
        let conn = sqlite::open(path).structured(StoreError::Open {
            path: path.display().to_string(),
        })?;
        conn.execute("PRAGMA journal_mode = WAL")
            .structured(StoreError::Open {
                path: path.display().to_string(),
            })?;
        conn.execute(format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .structured(StoreError::Open {
                path: path.display().to_string(),
            })?;
        conn.execute("PRAGMA foreign_keys = ON")
            .structured(StoreError::Open {
                path: path.display().to_string(),
            })?;
        conn.execute("PRAGMA temp_store = MEMORY")
            .structured(StoreError::Open {
                path: path.display().to_string(),
            })?;
        conn.execute("PRAGMA mmap_size = 268435456")
            .structured(StoreError::Open {
                path: path.display().to_string(),
            })?;

        migrations::apply(&conn).structured(StoreError::Migration { version: 0 })?;

        info!("Opened durable store at {}", path.display());
        Ok(DurableStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ManagerError> {
        let conn = sqlite::open(":memory:").structured(StoreError::Open {
            path: ":memory:".to_string(),
        })?;
        conn.execute("PRAGMA foreign_keys = ON")
            .structured(StoreError::Open {
                path: ":memory:".to_string(),
            })?;
        migrations::apply(&conn).structured(StoreError::Migration { version: 0 })?;
        Ok(DurableStore {
            conn: Mutex::new(conn),
        })
    }

    /// Atomic reservation for the Download FSM's `check-exists` transition
    /// (spec §4.1). Only takes over an existing row if it is `pending`,
    /// `failed`, or a `downloading` row older than `staleness_secs`.
    pub fn reserve_download(
        &self,
        image_id: &str,
        object_key: &str,
        staleness_secs: i64,
    ) -> Result<ReserveOutcome, ManagerError> {
        let conn = self.lock();
        let now = Utc::now();

        conn.execute("BEGIN IMMEDIATE")
            .structured(StoreError::Write)?;

        let existing = Self::fetch_image_by_key(&conn, object_key).structured(StoreError::Query)?;

        let outcome = match existing {
            None => {
                let mut stmt = conn
                    .prepare(
                        "INSERT INTO images
                            (image_id, object_key, download_status, activation_status,
                             created_at, download_started_at, updated_at)
                         VALUES (?, ?, 'downloading', 'inactive', ?, ?, ?)",
                    )
                    .structured(StoreError::Write)?;
                stmt.bind((1, image_id)).structured(StoreError::Write)?;
                stmt.bind((2, object_key)).structured(StoreError::Write)?;
                let now_str = now.to_rfc3339();
                stmt.bind((3, now_str.as_str())).structured(StoreError::Write)?;
                stmt.bind((4, now_str.as_str())).structured(StoreError::Write)?;
                stmt.bind((5, now_str.as_str())).structured(StoreError::Write)?;
                stmt.next().structured(StoreError::Write)?;
                ReserveOutcome::Reserved
            }
            Some(image) if image.download_status == DownloadStatus::Completed => {
                ReserveOutcome::AlreadyCompleted
            }
            Some(image) => {
                let stale = image
                    .download_started_at
                    .map(|t| (now - t).num_seconds() > staleness_secs)
                    .unwrap_or(true);
                let takeable = image.download_status == DownloadStatus::Pending
                    || image.download_status == DownloadStatus::Failed
                    || (image.download_status == DownloadStatus::Downloading && stale);

                if takeable {
                    let mut stmt = conn
                        .prepare(
                            "UPDATE images SET download_status = 'downloading',
                                download_started_at = ?, updated_at = ? WHERE object_key = ?",
                        )
                        .structured(StoreError::Write)?;
                    let now_str = now.to_rfc3339();
                    stmt.bind((1, now_str.as_str())).structured(StoreError::Write)?;
                    stmt.bind((2, now_str.as_str())).structured(StoreError::Write)?;
                    stmt.bind((3, object_key)).structured(StoreError::Write)?;
                    stmt.next().structured(StoreError::Write)?;
                    ReserveOutcome::Reserved
                } else {
                    ReserveOutcome::InProgress
                }
            }
        };

        conn.execute("COMMIT").structured(StoreError::Write)?;
        info!("images: reserve_download({object_key}) -> {outcome:?}");
        Ok(outcome)
    }

    pub fn store_image_metadata(
        &self,
        image_id: &str,
        object_key: &str,
        local_path: &str,
        checksum: &str,
        size_bytes: u64,
    ) -> Result<(), ManagerError> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn
            .prepare(
                "INSERT INTO images
                    (image_id, object_key, local_path, checksum, size_bytes,
                     download_status, activation_status, created_at, downloaded_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, 'completed', 'inactive', ?, ?, ?)
                 ON CONFLICT(object_key) DO UPDATE SET
                    local_path = excluded.local_path,
                    checksum = excluded.checksum,
                    size_bytes = excluded.size_bytes,
                    download_status = 'completed',
                    downloaded_at = excluded.downloaded_at,
                    updated_at = excluded.updated_at",
            )
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.bind((2, object_key)).structured(StoreError::Write)?;
        stmt.bind((3, local_path)).structured(StoreError::Write)?;
        stmt.bind((4, checksum)).structured(StoreError::Write)?;
        stmt.bind((5, size_bytes as i64)).structured(StoreError::Write)?;
        stmt.bind((6, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((7, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((8, now.as_str())).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;
        info!("images: store_image_metadata({object_key})");
        Ok(())
    }

    pub fn check_image_downloaded(&self, object_key: &str) -> Result<Option<Image>, ManagerError> {
        let conn = self.lock();
        let image = Self::fetch_image_by_key(&conn, object_key).structured(StoreError::Query)?;
        Ok(image.filter(|i| i.download_status == DownloadStatus::Completed))
    }

    pub fn check_image_unpacked(
        &self,
        image_id: &str,
    ) -> Result<Option<UnpackedImage>, ManagerError> {
        let conn = self.lock();
        let row = Self::fetch_unpacked(&conn, image_id).structured(StoreError::Query)?;
        Ok(row.filter(|u| u.layout_verified))
    }

    pub fn delete_unpacked(&self, image_id: &str) -> Result<(), ManagerError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("DELETE FROM unpacked_images WHERE image_id = ?")
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn store_unpacked(
        &self,
        image_id: &str,
        device_id: &str,
        device_name: &str,
        device_path: &str,
        size_bytes: u64,
        file_count: u64,
    ) -> Result<(), ManagerError> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn
            .prepare(
                "INSERT INTO unpacked_images
                    (image_id, device_id, device_name, device_path, size_bytes,
                     file_count, layout_verified, created_at, unpacked_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
                 ON CONFLICT(image_id) DO UPDATE SET
                    device_id = excluded.device_id,
                    device_name = excluded.device_name,
                    device_path = excluded.device_path,
                    size_bytes = excluded.size_bytes,
                    file_count = excluded.file_count,
                    layout_verified = 1,
                    unpacked_at = excluded.unpacked_at,
                    updated_at = excluded.updated_at",
            )
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.bind((2, device_id)).structured(StoreError::Write)?;
        stmt.bind((3, device_name)).structured(StoreError::Write)?;
        stmt.bind((4, device_path)).structured(StoreError::Write)?;
        stmt.bind((5, size_bytes as i64)).structured(StoreError::Write)?;
        stmt.bind((6, file_count as i64)).structured(StoreError::Write)?;
        stmt.bind((7, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((8, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((9, now.as_str())).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;
        info!("unpacked_images: store_unpacked({image_id})");
        Ok(())
    }

    pub fn check_snapshot_exists(
        &self,
        image_id: &str,
        snapshot_name: &str,
    ) -> Result<Option<Snapshot>, ManagerError> {
        let conn = self.lock();
        let row =
            Self::fetch_snapshot(&conn, image_id, snapshot_name).structured(StoreError::Query)?;
        Ok(row.filter(|s| s.active))
    }

    pub fn delete_snapshot(&self, image_id: &str, snapshot_name: &str) -> Result<(), ManagerError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("DELETE FROM snapshots WHERE image_id = ? AND snapshot_name = ?")
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.bind((2, snapshot_name)).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;
        Ok(())
    }

    pub fn store_snapshot(
        &self,
        image_id: &str,
        snapshot_id: &str,
        snapshot_name: &str,
        device_path: &str,
        origin_device_id: &str,
    ) -> Result<(), ManagerError> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();

        let mut stmt = conn
            .prepare(
                "INSERT INTO snapshots
                    (image_id, snapshot_id, snapshot_name, device_path, origin_device_id,
                     active, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, 1, ?, ?)
                 ON CONFLICT(image_id, snapshot_name) DO UPDATE SET
                    snapshot_id = excluded.snapshot_id,
                    device_path = excluded.device_path,
                    origin_device_id = excluded.origin_device_id,
                    active = 1,
                    updated_at = excluded.updated_at",
            )
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.bind((2, snapshot_id)).structured(StoreError::Write)?;
        stmt.bind((3, snapshot_name)).structured(StoreError::Write)?;
        stmt.bind((4, device_path)).structured(StoreError::Write)?;
        stmt.bind((5, origin_device_id)).structured(StoreError::Write)?;
        stmt.bind((6, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((7, now.as_str())).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;

        let mut stmt = conn
            .prepare(
                "UPDATE images SET activation_status = 'active', activated_at = ?, updated_at = ?
                 WHERE image_id = ?",
            )
            .structured(StoreError::Write)?;
        stmt.bind((1, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((2, now.as_str())).structured(StoreError::Write)?;
        stmt.bind((3, image_id)).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;

        info!("snapshots: store_snapshot({image_id}, {snapshot_name})");
        Ok(())
    }

    pub fn acquire_image_lock(&self, image_id: &str, holder: &str) -> Result<(), ManagerError> {
        let conn = self.lock();
        let now = Utc::now();
        let mut stmt = conn
            .prepare("INSERT INTO image_locks (image_id, locked_at, locked_by) VALUES (?, ?, ?)")
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.bind((2, now.timestamp())).structured(StoreError::Write)?;
        stmt.bind((3, holder)).structured(StoreError::Write)?;

        match stmt.next() {
            Ok(_) => {
                info!("image_locks: acquire_image_lock({image_id}) by {holder}");
                Ok(())
            }
            Err(e) if e.message.as_deref().unwrap_or("").contains("UNIQUE") => {
                let existing = Self::fetch_image_lock(&conn, image_id)
                    .structured(StoreError::Query)?
                    .structured(StoreError::Query)?;
                Err(ManagerError::new(
                    pipeline_api::error::SafeguardError::ImageLocked {
                        image_id: image_id.to_string(),
                        holder: existing.locked_by,
                        acquired_at: existing.locked_at,
                    },
                ))
            }
            Err(e) => Err(e).structured(StoreError::Write),
        }
    }

    /// Idempotent: absence of the row is success (spec §4.1).
    pub fn release_image_lock(&self, image_id: &str) -> Result<(), ManagerError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("DELETE FROM image_locks WHERE image_id = ?")
            .structured(StoreError::Write)?;
        stmt.bind((1, image_id)).structured(StoreError::Write)?;
        stmt.next().structured(StoreError::Write)?;
        Ok(())
    }

    pub fn list_images(&self) -> Result<Vec<Image>, ManagerError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM images").structured(StoreError::Query)?;
        let mut out = Vec::new();
        for row in stmt.into_iter() {
            out.push(Self::row_to_image(row.structured(StoreError::Query)?));
        }
        Ok(out)
    }

    /// Every unpacked-image row, regardless of `layout_verified` (spec §4.7
    /// GC needs to see in-flight rows too, not just verified ones).
    pub fn list_unpacked_images(&self) -> Result<Vec<UnpackedImage>, ManagerError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM unpacked_images")
            .structured(StoreError::Query)?;
        let mut out = Vec::new();
        for row in stmt.into_iter() {
            out.push(Self::row_to_unpacked(row.structured(StoreError::Query)?));
        }
        Ok(out)
    }

    pub fn list_active_snapshots(&self) -> Result<Vec<Snapshot>, ManagerError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM snapshots WHERE active = 1")
            .structured(StoreError::Query)?;
        let mut out = Vec::new();
        for row in stmt.into_iter() {
            out.push(Self::row_to_snapshot(row.structured(StoreError::Query)?));
        }
        Ok(out)
    }

    pub fn list_image_locks(&self) -> Result<Vec<ImageLock>, ManagerError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM image_locks")
            .structured(StoreError::Query)?;
        let mut out = Vec::new();
        for row in stmt.into_iter() {
            let row = row.structured(StoreError::Query)?;
            out.push(ImageLock {
                image_id: row.read::<&str, _>("image_id").to_string(),
                locked_at: row.read::<i64, _>("locked_at"),
                locked_by: row.read::<&str, _>("locked_by").to_string(),
            });
        }
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("durable store mutex poisoned")
    }

    fn fetch_image_by_key(conn: &Connection, object_key: &str) -> sqlite::Result<Option<Image>> {
        let mut stmt = conn.prepare("SELECT * FROM images WHERE object_key = ?")?;
        stmt.bind((1, object_key))?;
        if let Some(row) = stmt.into_iter().next() {
            Ok(Some(Self::row_to_image(row?)))
        } else {
            Ok(None)
        }
    }

    fn fetch_unpacked(conn: &Connection, image_id: &str) -> sqlite::Result<Option<UnpackedImage>> {
        let mut stmt = conn.prepare("SELECT * FROM unpacked_images WHERE image_id = ?")?;
        stmt.bind((1, image_id))?;
        if let Some(row) = stmt.into_iter().next() {
            Ok(Some(Self::row_to_unpacked(row?)))
        } else {
            Ok(None)
        }
    }

    fn fetch_snapshot(
        conn: &Connection,
        image_id: &str,
        snapshot_name: &str,
    ) -> sqlite::Result<Option<Snapshot>> {
        let mut stmt =
            conn.prepare("SELECT * FROM snapshots WHERE image_id = ? AND snapshot_name = ?")?;
        stmt.bind((1, image_id))?;
        stmt.bind((2, snapshot_name))?;
        if let Some(row) = stmt.into_iter().next() {
            Ok(Some(Self::row_to_snapshot(row?)))
        } else {
            Ok(None)
        }
    }

    fn fetch_image_lock(conn: &Connection, image_id: &str) -> sqlite::Result<Option<ImageLock>> {
        let mut stmt = conn.prepare("SELECT * FROM image_locks WHERE image_id = ?")?;
        stmt.bind((1, image_id))?;
        if let Some(row) = stmt.into_iter().next() {
            let row = row?;
            Ok(Some(ImageLock {
                image_id: row.read::<&str, _>("image_id").to_string(),
                locked_at: row.read::<i64, _>("locked_at"),
                locked_by: row.read::<&str, _>("locked_by").to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    fn parse_ts(s: Option<&str>) -> Option<chrono::DateTime<Utc>> {
        s.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn row_to_image(row: sqlite::Row) -> Image {
        Image {
            image_id: row.read::<&str, _>("image_id").to_string(),
            object_key: row.read::<&str, _>("object_key").to_string(),
            local_path: row.read::<&str, _>("local_path").to_string(),
            checksum: row.try_read::<&str, _>("checksum").ok().map(String::from),
            size_bytes: row.read::<i64, _>("size_bytes") as u64,
            download_status: match row.read::<&str, _>("download_status") {
                "pending" => DownloadStatus::Pending,
                "downloading" => DownloadStatus::Downloading,
                "completed" => DownloadStatus::Completed,
                _ => DownloadStatus::Failed,
            },
            activation_status: match row.read::<&str, _>("activation_status") {
                "active" => ActivationStatus::Active,
                "failed" => ActivationStatus::Failed,
                _ => ActivationStatus::Inactive,
            },
            created_at: Self::parse_ts(Some(row.read::<&str, _>("created_at")))
                .unwrap_or_else(Utc::now),
            download_started_at: Self::parse_ts(row.try_read::<&str, _>("download_started_at").ok()),
            downloaded_at: Self::parse_ts(row.try_read::<&str, _>("downloaded_at").ok()),
            activated_at: Self::parse_ts(row.try_read::<&str, _>("activated_at").ok()),
            updated_at: Self::parse_ts(Some(row.read::<&str, _>("updated_at")))
                .unwrap_or_else(Utc::now),
        }
    }

    fn row_to_unpacked(row: sqlite::Row) -> UnpackedImage {
        UnpackedImage {
            image_id: row.read::<&str, _>("image_id").to_string(),
            device_id: row.read::<&str, _>("device_id").to_string(),
            device_name: row.read::<&str, _>("device_name").to_string(),
            device_path: row.read::<&str, _>("device_path").to_string(),
            size_bytes: row.read::<i64, _>("size_bytes") as u64,
            file_count: row.read::<i64, _>("file_count") as u64,
            layout_verified: row.read::<i64, _>("layout_verified") != 0,
            created_at: Self::parse_ts(Some(row.read::<&str, _>("created_at")))
                .unwrap_or_else(Utc::now),
            unpacked_at: Self::parse_ts(Some(row.read::<&str, _>("unpacked_at")))
                .unwrap_or_else(Utc::now),
            updated_at: Self::parse_ts(Some(row.read::<&str, _>("updated_at")))
                .unwrap_or_else(Utc::now),
        }
    }

    fn row_to_snapshot(row: sqlite::Row) -> Snapshot {
        Snapshot {
            image_id: row.read::<&str, _>("image_id").to_string(),
            snapshot_id: row.read::<&str, _>("snapshot_id").to_string(),
            snapshot_name: row.read::<&str, _>("snapshot_name").to_string(),
            device_path: row.read::<&str, _>("device_path").to_string(),
            origin_device_id: row.read::<&str, _>("origin_device_id").to_string(),
            active: row.read::<i64, _>("active") != 0,
            created_at: Self::parse_ts(Some(row.read::<&str, _>("created_at")))
                .unwrap_or_else(Utc::now),
            deactivated_at: Self::parse_ts(row.try_read::<&str, _>("deactivated_at").ok()),
            updated_at: Self::parse_ts(Some(row.read::<&str, _>("updated_at")))
                .unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_download_then_store_metadata_roundtrips() {
        let store = DurableStore::open_in_memory().unwrap();
        let outcome = store
            .reserve_download("img-1", "images/node/5.tar", 3600)
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);

        assert!(store.check_image_downloaded("images/node/5.tar").unwrap().is_none());

        store
            .store_image_metadata("img-1", "images/node/5.tar", "/tmp/img1.tar", &"a".repeat(64), 1024)
            .unwrap();

        let image = store
            .check_image_downloaded("images/node/5.tar")
            .unwrap()
            .expect("should be completed");
        assert_eq!(image.download_status, DownloadStatus::Completed);
        assert_eq!(image.size_bytes, 1024);
    }

    #[test]
    fn reserve_download_is_monotonic_on_completion() {
        let store = DurableStore::open_in_memory().unwrap();
        store.reserve_download("img-1", "k", 3600).unwrap();
        store
            .store_image_metadata("img-1", "k", "/tmp/x", &"a".repeat(64), 10)
            .unwrap();
        let outcome = store.reserve_download("img-1", "k", 3600).unwrap();
        assert_eq!(outcome, ReserveOutcome::AlreadyCompleted);
        assert!(store.check_image_downloaded("k").unwrap().is_some());
    }

    #[test]
    fn reserve_download_rejects_fresh_in_progress_takeover() {
        let store = DurableStore::open_in_memory().unwrap();
        store.reserve_download("img-1", "k", 3600).unwrap();
        let outcome = store.reserve_download("img-1", "k", 3600).unwrap();
        assert_eq!(outcome, ReserveOutcome::InProgress);
    }

    #[test]
    fn reserve_download_allows_stale_takeover() {
        let store = DurableStore::open_in_memory().unwrap();
        store.reserve_download("img-1", "k", 3600).unwrap();
        // staleness_secs = 0 means "always stale"
        let outcome = store.reserve_download("img-1", "k", -1).unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);
    }

    #[test]
    fn image_lock_acquire_release_round_trips() {
        let store = DurableStore::open_in_memory().unwrap();
        store.acquire_image_lock("img-1", "unpack-fsm").unwrap();
        let err = store.acquire_image_lock("img-1", "other").unwrap_err();
        assert!(matches!(
            err.kind(),
            pipeline_api::error::ErrorKind::Safeguard(
                pipeline_api::error::SafeguardError::ImageLocked { .. }
            )
        ));
        store.release_image_lock("img-1").unwrap();
        // idempotent
        store.release_image_lock("img-1").unwrap();
        // lock is free again
        store.acquire_image_lock("img-1", "unpack-fsm").unwrap();
    }

    #[test]
    fn store_unpacked_and_check_round_trip() {
        let store = DurableStore::open_in_memory().unwrap();
        store.reserve_download("img-1", "k", 3600).unwrap();
        store
            .store_image_metadata("img-1", "k", "/tmp/x", &"a".repeat(64), 10)
            .unwrap();
        store
            .store_unpacked("img-1", "dev-img-1", "thin-dev-img-1", "/dev/mapper/thin-dev-img-1", 2048, 42)
            .unwrap();
        let unpacked = store.check_image_unpacked("img-1").unwrap().unwrap();
        assert!(unpacked.layout_verified);
        assert_eq!(unpacked.file_count, 42);
    }

    #[test]
    fn delete_unpacked_then_check_returns_none() {
        let store = DurableStore::open_in_memory().unwrap();
        store.reserve_download("img-1", "k", 3600).unwrap();
        store
            .store_image_metadata("img-1", "k", "/tmp/x", &"a".repeat(64), 10)
            .unwrap();
        store
            .store_unpacked("img-1", "dev-img-1", "thin-dev-img-1", "/dev/mapper/thin-dev-img-1", 2048, 42)
            .unwrap();
        store.delete_unpacked("img-1").unwrap();
        assert!(store.check_image_unpacked("img-1").unwrap().is_none());
    }

    #[test]
    fn store_snapshot_activates_image() {
        let store = DurableStore::open_in_memory().unwrap();
        store.reserve_download("img-1", "k", 3600).unwrap();
        store
            .store_image_metadata("img-1", "k", "/tmp/x", &"a".repeat(64), 10)
            .unwrap();
        store
            .store_unpacked("img-1", "dev-img-1", "thin-dev-img-1", "/dev/mapper/thin-dev-img-1", 2048, 42)
            .unwrap();
        store
            .store_snapshot("img-1", "snap-dev-img-1", "snap-img-1", "/dev/mapper/snap-img-1", "dev-img-1")
            .unwrap();
        let snap = store.check_snapshot_exists("img-1", "snap-img-1").unwrap().unwrap();
        assert!(snap.active);
        let image = store.check_image_downloaded("k").unwrap().unwrap();
        assert_eq!(image.activation_status, ActivationStatus::Active);
    }
}
