//! SQLite persistence for test cases, runs, steps and allocations

use crate::types::*;
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Structured create/update calls the engine and aggregator persist through.
///
/// Implementations must refuse to modify a run that is already terminal.
pub trait RunStore: Send + Sync {
    fn get_test_case(&self, id: &str) -> Result<Option<TestCase>>;
    fn save_test_case(&self, case: &TestCase) -> Result<()>;
    fn update_reliability(&self, test_case_id: &str, score: f64) -> Result<()>;

    fn create_run(&self, run: &TestRun) -> Result<()>;
    fn update_run(&self, run: &TestRun) -> Result<()>;
    fn get_run(&self, id: &str) -> Result<Option<TestRun>>;
    /// Completed, failed and cancelled runs of a test case, oldest first
    fn terminal_runs(&self, test_case_id: &str) -> Result<Vec<TestRun>>;

    fn save_step(&self, step: &TestStep) -> Result<()>;
    fn list_steps(&self, test_run_id: &str) -> Result<Vec<TestStep>>;

    fn record_allocation(&self, allocation: &Allocation) -> Result<()>;
    fn update_allocation(&self, allocation: &Allocation) -> Result<()>;
    fn allocations_for_run(&self, test_run_id: &str) -> Result<Vec<Allocation>>;
}

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                spec TEXT NOT NULL,
                reliability_score REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_runs (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_runs_case ON test_runs(test_case_id, status);

            CREATE TABLE IF NOT EXISTS test_steps (
                test_run_id TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (test_run_id, step_number)
            );

            CREATE TABLE IF NOT EXISTS allocations (
                id TEXT PRIMARY KEY,
                sandbox_id TEXT NOT NULL,
                test_run_id TEXT NOT NULL,
                allocated_at INTEGER NOT NULL,
                released_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_allocations_run ON allocations(test_run_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

impl RunStore for Database {
    fn get_test_case(&self, id: &str) -> Result<Option<TestCase>> {
        let conn = self.conn.lock();
        let row: Option<(String, f64)> = conn
            .query_row(
                "SELECT spec, reliability_score FROM test_cases WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((spec, score)) => {
                let mut case: TestCase = serde_json::from_str(&spec)?;
                case.reliability_score = score;
                Ok(Some(case))
            }
            None => Ok(None),
        }
    }

    fn save_test_case(&self, case: &TestCase) -> Result<()> {
        let conn = self.conn.lock();
        let now = now();
        conn.execute(
            "INSERT INTO test_cases (id, name, spec, reliability_score, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET name = ?2, spec = ?3, updated_at = ?5",
            params![
                case.id,
                case.name,
                serde_json::to_string(case)?,
                case.reliability_score,
                now
            ],
        )?;
        debug!("Saved test case {}", case.id);
        Ok(())
    }

    fn update_reliability(&self, test_case_id: &str, score: f64) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE test_cases SET reliability_score = ?1, updated_at = ?2 WHERE id = ?3",
            params![score, now(), test_case_id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("test_case", test_case_id));
        }
        Ok(())
    }

    fn create_run(&self, run: &TestRun) -> Result<()> {
        let conn = self.conn.lock();
        let now = now();
        conn.execute(
            "INSERT INTO test_runs (id, test_case_id, status, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                run.id,
                run.test_case_id,
                run.status.to_string(),
                serde_json::to_string(run)?,
                now
            ],
        )?;
        debug!("Created test run {}", run.id);
        Ok(())
    }

    fn update_run(&self, run: &TestRun) -> Result<()> {
        let conn = self.conn.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM test_runs WHERE id = ?1",
                params![run.id],
                |row| row.get(0),
            )
            .optional()?;

        let current = current.ok_or_else(|| Error::not_found("test_run", &run.id))?;
        if RunStatus::parse(&current).is_some_and(|s| s.is_terminal()) {
            return Err(Error::InvalidStateTransition {
                from: current,
                to: run.status.to_string(),
            });
        }

        conn.execute(
            "UPDATE test_runs SET status = ?1, data = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                run.status.to_string(),
                serde_json::to_string(run)?,
                now(),
                run.id
            ],
        )?;
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Option<TestRun>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM test_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    fn terminal_runs(&self, test_case_id: &str) -> Result<Vec<TestRun>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM test_runs
             WHERE test_case_id = ?1 AND status IN ('completed', 'failed', 'cancelled')
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![test_case_id], |row| row.get::<_, String>(0))?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(serde_json::from_str(&row?)?);
        }
        Ok(runs)
    }

    fn save_step(&self, step: &TestStep) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO test_steps (test_run_id, step_number, status, data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(test_run_id, step_number) DO UPDATE SET status = ?3, data = ?4, updated_at = ?5",
            params![
                step.test_run_id,
                step.step_number,
                step.status.to_string(),
                serde_json::to_string(step)?,
                now()
            ],
        )?;
        Ok(())
    }

    fn list_steps(&self, test_run_id: &str) -> Result<Vec<TestStep>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM test_steps WHERE test_run_id = ?1 ORDER BY step_number ASC",
        )?;
        let rows = stmt.query_map(params![test_run_id], |row| row.get::<_, String>(0))?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(serde_json::from_str(&row?)?);
        }
        Ok(steps)
    }

    fn record_allocation(&self, allocation: &Allocation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO allocations (id, sandbox_id, test_run_id, allocated_at, released_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                allocation.id,
                allocation.sandbox_id,
                allocation.test_run_id,
                allocation.allocated_at,
                allocation.released_at
            ],
        )?;
        Ok(())
    }

    fn update_allocation(&self, allocation: &Allocation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE allocations SET released_at = ?1 WHERE id = ?2 AND released_at IS NULL",
            params![allocation.released_at, allocation.id],
        )?;
        Ok(())
    }

    fn allocations_for_run(&self, test_run_id: &str) -> Result<Vec<Allocation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, sandbox_id, test_run_id, allocated_at, released_at
             FROM allocations WHERE test_run_id = ?1 ORDER BY allocated_at ASC",
        )?;
        let rows = stmt.query_map(params![test_run_id], |row| {
            Ok(Allocation {
                id: row.get(0)?,
                sandbox_id: row.get(1)?,
                test_run_id: row.get(2)?,
                allocated_at: row.get(3)?,
                released_at: row.get(4)?,
            })
        })?;

        let mut allocations = Vec::new();
        for row in rows {
            allocations.push(row?);
        }
        Ok(allocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_case() -> TestCase {
        TestCase {
            id: "case-1".to_string(),
            name: "Checkout".to_string(),
            objective: "Buy one item".to_string(),
            base_url: None,
            tags: vec![],
            steps: vec![StepAction::navigate("/"), StepAction::click("#buy")],
            reliability_score: 0.0,
        }
    }

    #[test]
    fn test_case_roundtrip_keeps_score_column() {
        let db = Database::open_memory().unwrap();
        db.save_test_case(&sample_case()).unwrap();
        db.update_reliability("case-1", 0.6).unwrap();

        // Re-saving the definition must not reset the derived score
        db.save_test_case(&sample_case()).unwrap();
        let case = db.get_test_case("case-1").unwrap().unwrap();
        assert_eq!(case.steps.len(), 2);
        assert!((case.reliability_score - 0.6).abs() < 1e-9);

        assert!(matches!(
            db.update_reliability("missing", 0.1),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let db = Database::open_memory().unwrap();
        let mut run = TestRun::new("run-1", "case-1", 2);
        db.create_run(&run).unwrap();

        run.transition(RunStatus::Running).unwrap();
        db.update_run(&run).unwrap();
        run.transition(RunStatus::Completed).unwrap();
        db.update_run(&run).unwrap();

        run.completed_steps = 99;
        assert!(matches!(
            db.update_run(&run),
            Err(Error::InvalidStateTransition { .. })
        ));
        assert_eq!(db.get_run("run-1").unwrap().unwrap().completed_steps, 0);

        let history = db.terminal_runs("case-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Completed);
    }

    #[test]
    fn test_steps_upsert_in_order() {
        let db = Database::open_memory().unwrap();
        let mut second = TestStep::new("run-1", 2, StepAction::click("#b"));
        let first = TestStep::new("run-1", 1, StepAction::click("#a"));
        db.save_step(&second).unwrap();
        db.save_step(&first).unwrap();

        second.record_recovery(RecoveryAttempt::new(
            RecoveryStrategy::Renavigate,
            "navigated away",
            true,
        ));
        second.finish(StepStatus::Success, None);
        db.save_step(&second).unwrap();

        let steps = db.list_steps("run-1").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].step_number, 1);
        assert_eq!(steps[1].status, StepStatus::Success);
        assert_eq!(steps[1].recovery_attempts().len(), 1);
    }

    #[test]
    fn test_allocation_release_is_set_once() {
        let db = Database::open_memory().unwrap();
        let mut alloc = Allocation::new("sbx-1", "run-1");
        db.record_allocation(&alloc).unwrap();

        alloc.released_at = Some(100);
        db.update_allocation(&alloc).unwrap();
        alloc.released_at = Some(200);
        db.update_allocation(&alloc).unwrap();

        let stored = db.allocations_for_run("run-1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].released_at, Some(100));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let db = Database::open(&path).unwrap();
            db.save_test_case(&sample_case()).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.get_test_case("case-1").unwrap().is_some());
    }
}
