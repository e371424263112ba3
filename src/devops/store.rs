//! SQLite persistence for epics, runs, decisions, escalations and patterns.
//!
//! One `Store` wraps one connection. Each epic driver opens its own store so
//! concurrently running epics share nothing but the database file.

use once_cell::sync::Lazy;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::error::{EngineError, EngineResult, Rationale};
use super::operations::epic::{Epic, EpicStatus, EpicWorkspace};
use super::operations::escalation::{EscalationMessage, EscalationRecord, ResolutionOption};
use super::operations::patterns::PatternRecord;
use super::operations::router::{Priority, RoutingDecision};
use super::pipeline::{RunStatus, WorkflowRun};
use super::stages::{RouteTarget, StageType};

static MIGRATIONS: Lazy<Migrations<'static>> = Lazy::new(|| {
    Migrations::new(vec![
        M::up(
            "CREATE TABLE epics (
                id TEXT PRIMARY KEY,
                objective TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                branch TEXT NOT NULL,
                current_stage TEXT NOT NULL,
                status TEXT NOT NULL,
                resume_next INTEGER NOT NULL DEFAULT 0,
                blocked_reason TEXT,
                attempt_floor INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL UNIQUE,
                epic_id TEXT NOT NULL REFERENCES epics(id),
                stage TEXT NOT NULL,
                session_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                card_id TEXT NOT NULL,
                status TEXT NOT NULL,
                signals TEXT NOT NULL DEFAULT '[]',
                turns_used INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                stop_reason TEXT,
                last_card_status TEXT
            );
            CREATE INDEX idx_runs_epic ON runs(epic_id, seq);
            CREATE UNIQUE INDEX idx_runs_one_running ON runs(epic_id) WHERE status = 'RUNNING';",
        ),
        M::up(
            "CREATE TABLE decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                epic_id TEXT NOT NULL REFERENCES epics(id),
                run_id TEXT UNIQUE,
                source_stage TEXT NOT NULL,
                target TEXT NOT NULL,
                priority TEXT NOT NULL,
                rationale TEXT NOT NULL,
                blocking_issues TEXT NOT NULL DEFAULT '[]',
                decided_at TEXT NOT NULL
            );
            CREATE INDEX idx_decisions_epic ON decisions(epic_id, id);",
        ),
        M::up(
            "CREATE TABLE escalations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                epic_id TEXT NOT NULL REFERENCES epics(id),
                stage TEXT NOT NULL,
                rationale TEXT NOT NULL,
                options TEXT NOT NULL,
                cost_so_far REAL NOT NULL,
                turns_so_far INTEGER NOT NULL,
                blocking_issues TEXT NOT NULL DEFAULT '[]',
                raised_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution TEXT
            );
            CREATE TABLE patterns (
                name TEXT NOT NULL,
                scope TEXT NOT NULL,
                body TEXT NOT NULL,
                confidence REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (name, scope)
            );",
        ),
    ])
});

/// Column lists shared by the row mappers below
const EPIC_COLUMNS: &str = "id, objective, workspace_path, branch, current_stage, status, \
     resume_next, blocked_reason, attempt_floor, created_at, updated_at";
const RUN_COLUMNS: &str = "run_id, epic_id, stage, session_id, iteration, card_id, status, \
     signals, turns_used, cost, started_at, completed_at, stop_reason, last_card_status";
const DECISION_COLUMNS: &str =
    "epic_id, run_id, source_stage, target, priority, rationale, blocking_issues, decided_at";
const ESCALATION_COLUMNS: &str = "id, epic_id, stage, rationale, options, cost_so_far, \
     turns_so_far, blocking_issues, raised_at, resolved_at, resolution";

/// SQLite-backed engine store
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path` and migrate it.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// In-memory database for dry runs and tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> EngineResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        MIGRATIONS.to_latest(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database file location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::worker("Store connection lock poisoned"))
    }

    // ---- epics ----

    pub fn insert_epic(&self, epic: &Epic) -> EngineResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO epics (id, objective, workspace_path, branch, current_stage, status,
                resume_next, blocked_reason, attempt_floor, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                epic.id,
                epic.objective,
                epic.workspace.path.to_string_lossy().to_string(),
                epic.workspace.branch,
                epic.current_stage.as_str(),
                epic.status.as_str(),
                epic.resume_next,
                epic.blocked_reason.map(|r| r.as_str()),
                epic.attempt_floor as i64,
                epic.created_at,
                epic.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Persist the mutable epic fields.
    pub fn update_epic(&self, epic: &Epic) -> EngineResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE epics SET current_stage = ?2, status = ?3, resume_next = ?4,
                blocked_reason = ?5, attempt_floor = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                epic.id,
                epic.current_stage.as_str(),
                epic.status.as_str(),
                epic.resume_next,
                epic.blocked_reason.map(|r| r.as_str()),
                epic.attempt_floor as i64,
                epic.updated_at,
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found(format!("epic {}", epic.id)));
        }
        Ok(())
    }

    pub fn load_epic(&self, epic_id: &str) -> EngineResult<Option<Epic>> {
        let conn = self.conn()?;
        let epic = conn
            .query_row(
                &format!("SELECT {} FROM epics WHERE id = ?1", EPIC_COLUMNS),
                params![epic_id],
                row_to_epic,
            )
            .optional()?;
        match epic {
            Some(mut epic) => {
                epic.stage_history = run_ids_for(&conn, &epic.id)?;
                Ok(Some(epic))
            }
            None => Ok(None),
        }
    }

    pub fn list_epics(&self, status: Option<EpicStatus>) -> EngineResult<Vec<Epic>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM epics WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at, id",
            EPIC_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], row_to_epic)?;
        let mut epics = rows.collect::<Result<Vec<_>, _>>()?;
        for epic in &mut epics {
            epic.stage_history = run_ids_for(&conn, &epic.id)?;
        }
        Ok(epics)
    }

    // ---- runs ----

    /// Insert or update a run keyed by run_id.
    /// Record a newly started run. A run id already on record is a worker fault.
    pub fn insert_run(&self, run: &WorkflowRun) -> EngineResult<()> {
        let signals = serde_json::to_string(&run.outcome_signals)?;
        let conn = self.conn()?;
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM runs WHERE run_id = ?1)",
            params![run.run_id],
            |row| row.get(0),
        )?;
        if taken {
            return Err(EngineError::worker(format!(
                "worker reused run id {} (already recorded)",
                run.run_id
            )));
        }
        conn.execute(
            "INSERT INTO runs (run_id, epic_id, stage, session_id, iteration, card_id, status,
                signals, turns_used, cost, started_at, completed_at, stop_reason, last_card_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                run.run_id,
                run.epic_id,
                run.stage_type.as_str(),
                run.session_id,
                run.iteration,
                run.card_id,
                run.status.as_str(),
                signals,
                run.turns_used as i64,
                run.cost,
                run.started_at,
                run.completed_at,
                run.stop_reason.map(|r| r.as_str()),
                run.last_card_status,
            ],
        )
        .map_err(|e| running_conflict(e, &run.epic_id))?;
        Ok(())
    }

    /// Persist the latest state of a recorded run.
    pub fn update_run(&self, run: &WorkflowRun) -> EngineResult<()> {
        let signals = serde_json::to_string(&run.outcome_signals)?;
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE runs SET status = ?2, signals = ?3, turns_used = ?4, cost = ?5,
                    completed_at = ?6, stop_reason = ?7, last_card_status = ?8
                 WHERE run_id = ?1",
                params![
                    run.run_id,
                    run.status.as_str(),
                    signals,
                    run.turns_used as i64,
                    run.cost,
                    run.completed_at,
                    run.stop_reason.map(|r| r.as_str()),
                    run.last_card_status,
                ],
            )
            .map_err(|e| running_conflict(e, &run.epic_id))?;
        if updated == 0 {
            return Err(EngineError::not_found(format!("run {}", run.run_id)));
        }
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> EngineResult<Option<WorkflowRun>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                row_to_run,
            )
            .optional()?)
    }

    /// All runs for an epic in stage_history order.
    pub fn runs_for_epic(&self, epic_id: &str) -> EngineResult<Vec<WorkflowRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE epic_id = ?1 ORDER BY seq",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![epic_id], row_to_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn runs_with_status(&self, status: RunStatus) -> EngineResult<Vec<WorkflowRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE status = ?1 ORDER BY seq",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn running_run(&self, epic_id: &str) -> EngineResult<Option<WorkflowRun>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM runs WHERE epic_id = ?1 AND status = 'RUNNING'",
                    RUN_COLUMNS
                ),
                params![epic_id],
                row_to_run,
            )
            .optional()?)
    }

    // ---- decisions ----

    /// Log a decision. A second decision for the same run is rejected.
    pub fn insert_decision(&self, decision: &RoutingDecision) -> EngineResult<()> {
        let issues = serde_json::to_string(&decision.blocking_issues)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO decisions (epic_id, run_id, source_stage, target, priority, rationale,
                blocking_issues, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision.epic_id,
                decision.run_id,
                decision.source_stage.as_str(),
                decision.target.as_str(),
                decision.priority.as_str(),
                decision.rationale.as_str(),
                issues,
                decision.decided_at,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EngineError::invalid_transition(format!(
                    "run {} already has a routing decision",
                    decision.run_id.as_deref().unwrap_or("-")
                ))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    pub fn decisions_for_epic(&self, epic_id: &str) -> EngineResult<Vec<RoutingDecision>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM decisions WHERE epic_id = ?1 ORDER BY id",
            DECISION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![epic_id], row_to_decision)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- escalations ----

    pub fn insert_escalation(&self, message: &EscalationMessage) -> EngineResult<i64> {
        let options = serde_json::to_string(&message.options)?;
        let issues = serde_json::to_string(&message.blocking_issues)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO escalations (epic_id, stage, rationale, options, cost_so_far,
                turns_so_far, blocking_issues, raised_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.epic_id,
                message.stage.as_str(),
                message.rationale.as_str(),
                options,
                message.cost_so_far,
                message.turns_so_far as i64,
                issues,
                message.raised_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn load_escalation(&self, id: i64) -> EngineResult<Option<EscalationRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM escalations WHERE id = ?1", ESCALATION_COLUMNS),
                params![id],
                row_to_escalation,
            )
            .optional()?)
    }

    /// Escalations, optionally only unresolved ones.
    pub fn list_escalations(&self, open_only: bool) -> EngineResult<Vec<EscalationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM escalations WHERE (?1 = 0 OR resolved_at IS NULL) ORDER BY id",
            ESCALATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![open_only], row_to_escalation)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent open escalation for an epic.
    pub fn open_escalation_for(&self, epic_id: &str) -> EngineResult<Option<EscalationRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {} FROM escalations WHERE epic_id = ?1 AND resolved_at IS NULL
                     ORDER BY id DESC LIMIT 1",
                    ESCALATION_COLUMNS
                ),
                params![epic_id],
                row_to_escalation,
            )
            .optional()?)
    }

    pub fn resolve_escalation(&self, id: i64, option: &ResolutionOption) -> EngineResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE escalations SET resolved_at = ?2, resolution = ?3
             WHERE id = ?1 AND resolved_at IS NULL",
            params![id, chrono::Utc::now().to_rfc3339(), option.to_string()],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found(format!("open escalation {}", id)));
        }
        Ok(())
    }

    // ---- patterns ----

    /// Insert or replace by (name, scope). Returns true when the record is new.
    pub fn upsert_pattern(&self, record: &PatternRecord) -> EngineResult<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM patterns WHERE name = ?1 AND scope = ?2)",
            params![record.name, record.scope],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO patterns (name, scope, body, confidence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name, scope) DO UPDATE SET
                body = excluded.body,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at",
            params![
                record.name,
                record.scope,
                record.body,
                record.confidence,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(!exists)
    }

    /// Patterns in any of `scopes`, highest confidence first.
    pub fn patterns_in_scopes(&self, scopes: &[&str]) -> EngineResult<Vec<PatternRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, scope, body, confidence FROM patterns
             WHERE scope = ?1 OR scope = ?2
             ORDER BY confidence DESC, name",
        )?;
        let first = scopes.first().copied().unwrap_or("");
        let second = scopes.get(1).copied().unwrap_or(first);
        let rows = stmt.query_map(params![first, second], |row| {
            Ok(PatternRecord {
                name: row.get(0)?,
                scope: row.get(1)?,
                body: row.get(2)?,
                confidence: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn run_ids_for(conn: &Connection, epic_id: &str) -> EngineResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT run_id FROM runs WHERE epic_id = ?1 ORDER BY seq")?;
    let rows = stmt.query_map(params![epic_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn conversion_error(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_column<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn parse_rationale(row: &Row, idx: usize) -> rusqlite::Result<Option<Rationale>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(value) => Rationale::parse(&value)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("Unknown rationale '{}'", value))),
        None => Ok(None),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

fn row_to_epic(row: &Row) -> rusqlite::Result<Epic> {
    let workspace_path: String = row.get(2)?;
    let attempt_floor: i64 = row.get(8)?;
    Ok(Epic {
        id: row.get(0)?,
        objective: row.get(1)?,
        workspace: EpicWorkspace {
            path: PathBuf::from(workspace_path),
            branch: row.get(3)?,
        },
        current_stage: parse_column::<StageType>(row, 4)?,
        status: parse_column::<EpicStatus>(row, 5)?,
        stage_history: Vec::new(),
        resume_next: row.get(6)?,
        blocked_reason: parse_rationale(row, 7)?,
        attempt_floor: attempt_floor.max(0) as usize,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_run(row: &Row) -> rusqlite::Result<WorkflowRun> {
    let turns: i64 = row.get(8)?;
    Ok(WorkflowRun {
        run_id: row.get(0)?,
        epic_id: row.get(1)?,
        stage_type: parse_column::<StageType>(row, 2)?,
        session_id: row.get(3)?,
        iteration: row.get(4)?,
        card_id: row.get(5)?,
        status: parse_column::<RunStatus>(row, 6)?,
        outcome_signals: parse_json(row, 7)?,
        turns_used: turns.max(0) as u64,
        cost: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        stop_reason: parse_rationale(row, 12)?,
        last_card_status: row.get(13)?,
    })
}

fn row_to_decision(row: &Row) -> rusqlite::Result<RoutingDecision> {
    Ok(RoutingDecision {
        epic_id: row.get(0)?,
        run_id: row.get(1)?,
        source_stage: parse_column::<StageType>(row, 2)?,
        target: parse_column::<RouteTarget>(row, 3)?,
        priority: parse_column::<Priority>(row, 4)?,
        rationale: parse_rationale(row, 5)?
            .ok_or_else(|| conversion_error(5, "Missing rationale"))?,
        blocking_issues: parse_json(row, 6)?,
        decided_at: row.get(7)?,
    })
}

fn row_to_escalation(row: &Row) -> rusqlite::Result<EscalationRecord> {
    let turns: i64 = row.get(6)?;
    let resolution: Option<String> = row.get(10)?;
    let resolution = match resolution {
        Some(raw) => Some(
            raw.parse::<ResolutionOption>()
                .map_err(|e| conversion_error(10, e))?,
        ),
        None => None,
    };
    Ok(EscalationRecord {
        id: row.get(0)?,
        message: EscalationMessage {
            epic_id: row.get(1)?,
            stage: parse_column::<StageType>(row, 2)?,
            rationale: parse_rationale(row, 3)?
                .ok_or_else(|| conversion_error(3, "Missing rationale"))?,
            options: parse_json(row, 4)?,
            cost_so_far: row.get(5)?,
            turns_so_far: turns.max(0) as u64,
            blocking_issues: parse_json(row, 7)?,
            raised_at: row.get(8)?,
        },
        resolved_at: row.get(9)?,
        resolution,
    })
}

/// Map the one-RUNNING-run index violation onto a rejected spawn.
fn running_conflict(e: rusqlite::Error, epic_id: &str) -> EngineError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            EngineError::spawn_rejected(format!("epic {} already has a RUNNING run", epic_id))
        }
        other => other.into(),
    }
}
