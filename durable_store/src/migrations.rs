//! Linear-versioned schema migrations (spec §4.1). Each migration runs
//! inside its own transaction and is skipped if its version already
//! appears in the `schema_migrations` log, mirroring the teacher's
//! `DataStore::make_datastore` idiom of `CREATE TABLE IF NOT EXISTS`
//! generalized into a proper migration ledger.

use anyhow::{Context, Error};
use sqlite::Connection;

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema",
        sql: r#"
            CREATE TABLE images (
                image_id TEXT PRIMARY KEY,
                object_key TEXT NOT NULL UNIQUE,
                local_path TEXT NOT NULL DEFAULT '',
                checksum TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                download_status TEXT NOT NULL DEFAULT 'pending',
                activation_status TEXT NOT NULL DEFAULT 'inactive',
                created_at TEXT NOT NULL,
                download_started_at TEXT,
                downloaded_at TEXT,
                activated_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE unpacked_images (
                image_id TEXT PRIMARY KEY REFERENCES images(image_id) ON DELETE CASCADE,
                device_id TEXT NOT NULL,
                device_name TEXT NOT NULL UNIQUE,
                device_path TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                file_count INTEGER NOT NULL DEFAULT 0,
                layout_verified INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                unpacked_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE snapshots (
                image_id TEXT NOT NULL REFERENCES images(image_id) ON DELETE CASCADE,
                snapshot_id TEXT NOT NULL UNIQUE,
                snapshot_name TEXT NOT NULL,
                device_path TEXT NOT NULL,
                origin_device_id TEXT NOT NULL REFERENCES unpacked_images(device_id) ON DELETE RESTRICT,
                active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                deactivated_at TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (image_id, snapshot_name)
            );

            CREATE TABLE image_locks (
                image_id TEXT PRIMARY KEY,
                locked_at INTEGER NOT NULL,
                locked_by TEXT NOT NULL
            );
        "#,
    },
];

pub fn apply(db: &Connection) -> Result<(), Error> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .context("Failed to create schema_migrations table")?;

    for migration in MIGRATIONS {
        let already_applied: bool = db
            .prepare("SELECT 1 FROM schema_migrations WHERE version = ?")
            .and_then(|mut stmt| {
                stmt.bind((1, migration.version as i64))?;
                Ok(stmt.into_iter().next().is_some())
            })
            .context("Failed to query schema_migrations")?;

        if already_applied {
            continue;
        }

        db.execute("BEGIN")
            .context("Failed to begin migration transaction")?;
        let result = db.execute(migration.sql).and_then(|_| {
            let mut stmt = db.prepare(
                "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
            )?;
            stmt.bind((1, migration.version as i64))?;
            stmt.bind((2, migration.description))?;
            stmt.bind((3, chrono::Utc::now().to_rfc3339().as_str()))?;
            stmt.next()?;
            Ok(())
        });

        match result {
            Ok(()) => db.execute("COMMIT").context("Failed to commit migration")?,
            Err(e) => {
                db.execute("ROLLBACK").ok();
                return Err(e).with_context(|| {
                    format!("Migration {} ({}) failed", migration.version, migration.description)
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let db = sqlite::open(":memory:").unwrap();
        apply(&db).unwrap();
        apply(&db).unwrap();
        let count: i64 = db
            .prepare("SELECT COUNT(*) FROM schema_migrations")
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
            .unwrap()
            .read(0);
        assert_eq!(count, MIGRATIONS.len() as i64);
    }
}
