//! Persistence for the FSM Runtime (spec §4.5/§6): `fsm_runs` and
//! `fsm_events` live in their own database file, separate from the Durable
//! Store's domain tables, following the same migration idiom as
//! `durable_store::migrations` (itself grounded on the teacher's
//! `DataStore::make_datastore`).

use std::sync::Mutex;

use anyhow::{Context, Error};
use chrono::Utc;
use log::info;
use sqlite::Connection;

const MIGRATION_SQL: &str = r#"
    CREATE TABLE fsm_runs (
        run_id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        correlation_id TEXT NOT NULL,
        queue TEXT,
        status TEXT NOT NULL DEFAULT 'doing',
        current_state TEXT NOT NULL,
        request_json TEXT NOT NULL,
        response_json TEXT,
        error_json TEXT,
        run_after INTEGER,
        delay_until TEXT,
        parent_run_id INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE fsm_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES fsm_runs(run_id) ON DELETE CASCADE,
        state TEXT NOT NULL,
        event_type TEXT NOT NULL,
        detail TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX idx_fsm_runs_action_status ON fsm_runs(action, status);
    CREATE INDEX idx_fsm_events_run_id ON fsm_events(run_id);
"#;

pub struct FsmStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: i64,
    pub action: String,
    pub correlation_id: String,
    pub status: String,
    pub current_state: String,
    pub request_json: String,
    pub response_json: Option<String>,
    pub error_json: Option<String>,
}

impl FsmStore {
    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create FSM runtime state directory")?;
        }
        let conn = sqlite::open(path)
            .with_context(|| format!("Failed to open FSM runtime store at '{}'", path.display()))?;
        conn.execute("PRAGMA journal_mode = WAL")?;
        conn.execute("PRAGMA foreign_keys = ON")?;
        Self::migrate(&conn)?;
        info!("Opened FSM runtime store at {}", path.display());
        Ok(FsmStore { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = sqlite::open(":memory:")?;
        conn.execute("PRAGMA foreign_keys = ON")?;
        Self::migrate(&conn)?;
        Ok(FsmStore { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> Result<(), Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )?;
        let applied: bool = conn
            .prepare("SELECT 1 FROM schema_migrations WHERE version = 1")?
            .into_iter()
            .next()
            .is_some();
        if applied {
            return Ok(());
        }
        conn.execute("BEGIN")?;
        let result = conn.execute(MIGRATION_SQL).and_then(|_| {
            let mut stmt =
                conn.prepare("INSERT INTO schema_migrations (version, applied_at) VALUES (1, ?)")?;
            stmt.bind((1, Utc::now().to_rfc3339().as_str()))?;
            stmt.next()?;
            Ok(())
        });
        match result {
            Ok(()) => conn.execute("COMMIT")?,
            Err(e) => {
                conn.execute("ROLLBACK").ok();
                return Err(e.into());
            }
        }
        Ok(())
    }

    pub fn create_run(
        &self,
        action: &str,
        correlation_id: &str,
        first_state: &str,
        request_json: &str,
        queue: Option<&str>,
        run_after: Option<i64>,
        parent: Option<i64>,
        delay_until: Option<chrono::DateTime<Utc>>,
    ) -> Result<i64, Error> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "INSERT INTO fsm_runs
                (action, correlation_id, queue, status, current_state, request_json,
                 run_after, parent_run_id, delay_until, created_at, updated_at)
             VALUES (?, ?, ?, 'doing', ?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, action))?;
        stmt.bind((2, correlation_id))?;
        stmt.bind((3, queue))?;
        stmt.bind((4, first_state))?;
        stmt.bind((5, request_json))?;
        stmt.bind((6, run_after))?;
        stmt.bind((7, parent))?;
        stmt.bind((8, delay_until.map(|t| t.to_rfc3339())))?;
        stmt.bind((9, now.as_str()))?;
        stmt.bind((10, now.as_str()))?;
        stmt.next()?;

        let run_id = conn
            .prepare("SELECT last_insert_rowid()")?
            .into_iter()
            .next()
            .context("Failed to read last_insert_rowid")??
            .read::<i64, _>(0);

        info!("fsm_runs: start({action}, run_id={run_id}, correlation_id={correlation_id})");
        Ok(run_id)
    }

    pub fn fetch_run(&self, run_id: i64) -> Result<Option<RunRow>, Error> {
        let conn = self.lock();
        Self::fetch_run_locked(&conn, run_id)
    }

    fn fetch_run_locked(conn: &Connection, run_id: i64) -> Result<Option<RunRow>, Error> {
        let mut stmt = conn.prepare("SELECT * FROM fsm_runs WHERE run_id = ?")?;
        stmt.bind((1, run_id))?;
        let Some(row) = stmt.into_iter().next() else {
            return Ok(None);
        };
        let row = row?;
        Ok(Some(RunRow {
            run_id: row.read::<i64, _>("run_id"),
            action: row.read::<&str, _>("action").to_string(),
            correlation_id: row.read::<&str, _>("correlation_id").to_string(),
            status: row.read::<&str, _>("status").to_string(),
            current_state: row.read::<&str, _>("current_state").to_string(),
            request_json: row.read::<&str, _>("request_json").to_string(),
            response_json: row.try_read::<&str, _>("response_json").ok().map(String::from),
            error_json: row.try_read::<&str, _>("error_json").ok().map(String::from),
        }))
    }

    pub fn doing_runs(&self, action: &str) -> Result<Vec<i64>, Error> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT run_id FROM fsm_runs WHERE action = ? AND status = 'doing'")?;
        stmt.bind((1, action))?;
        let mut ids = Vec::new();
        for row in stmt.into_iter() {
            ids.push(row?.read::<i64, _>(0));
        }
        Ok(ids)
    }

    pub fn advance(
        &self,
        run_id: i64,
        next_state: &str,
        response_json: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE fsm_runs SET current_state = ?, response_json = ?, updated_at = ? WHERE run_id = ?",
        )?;
        stmt.bind((1, next_state))?;
        stmt.bind((2, response_json))?;
        stmt.bind((3, now.as_str()))?;
        stmt.bind((4, run_id))?;
        stmt.next()?;
        Self::append_event(&conn, run_id, next_state, "advance", None)?;
        Ok(())
    }

    pub fn finish(
        &self,
        run_id: i64,
        status: RunTerminal,
        state: &str,
        response_json: Option<&str>,
        error_json: Option<&str>,
    ) -> Result<(), Error> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "UPDATE fsm_runs SET status = ?, current_state = ?, response_json = ?,
                error_json = ?, updated_at = ? WHERE run_id = ?",
        )?;
        stmt.bind((1, status.as_str()))?;
        stmt.bind((2, state))?;
        stmt.bind((3, response_json))?;
        stmt.bind((4, error_json))?;
        stmt.bind((5, now.as_str()))?;
        stmt.bind((6, run_id))?;
        stmt.next()?;
        Self::append_event(&conn, run_id, state, status.as_str(), error_json)?;
        info!("fsm_runs: run {run_id} -> {}", status.as_str());
        Ok(())
    }

    fn append_event(
        conn: &Connection,
        run_id: i64,
        state: &str,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<(), Error> {
        let mut stmt = conn.prepare(
            "INSERT INTO fsm_events (run_id, state, event_type, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, run_id))?;
        stmt.bind((2, state))?;
        stmt.bind((3, event_type))?;
        stmt.bind((4, detail))?;
        stmt.bind((5, Utc::now().to_rfc3339().as_str()))?;
        stmt.next()?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("fsm store mutex poisoned")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTerminal {
    Completed,
    Aborted,
    Failed,
}

impl RunTerminal {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTerminal::Completed => "completed",
            RunTerminal::Aborted => "aborted",
            RunTerminal::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_fetch_round_trips() {
        let store = FsmStore::open_in_memory().unwrap();
        let run_id = store
            .create_run("download-image", "corr-1", "check-exists", "{}", Some("download"), None, None, None)
            .unwrap();
        let row = store.fetch_run(run_id).unwrap().unwrap();
        assert_eq!(row.status, "doing");
        assert_eq!(row.current_state, "check-exists");
    }

    #[test]
    fn advance_then_finish_updates_status() {
        let store = FsmStore::open_in_memory().unwrap();
        let run_id = store
            .create_run("download-image", "corr-1", "check-exists", "{}", None, None, None, None)
            .unwrap();
        store.advance(run_id, "download", Some("{\"x\":1}")).unwrap();
        let row = store.fetch_run(run_id).unwrap().unwrap();
        assert_eq!(row.current_state, "download");

        store
            .finish(run_id, RunTerminal::Completed, "complete", Some("{\"x\":2}"), None)
            .unwrap();
        let row = store.fetch_run(run_id).unwrap().unwrap();
        assert_eq!(row.status, "completed");
    }

    #[test]
    fn doing_runs_lists_only_in_progress() {
        let store = FsmStore::open_in_memory().unwrap();
        let r1 = store
            .create_run("unpack-image", "c1", "check-unpacked", "{}", None, None, None, None)
            .unwrap();
        let r2 = store
            .create_run("unpack-image", "c2", "check-unpacked", "{}", None, None, None, None)
            .unwrap();
        store.finish(r2, RunTerminal::Completed, "complete", None, None).unwrap();

        let doing = store.doing_runs("unpack-image").unwrap();
        assert_eq!(doing, vec![r1]);
    }
}
