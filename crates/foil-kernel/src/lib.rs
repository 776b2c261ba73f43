use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage kernel for the case orchestration engine. One SQLite database
/// holds every durable table the engine relies on: the case fields it owns,
/// the run and proposal ledgers, execution claims, the local job queue, the
/// dead-letter queue, reaper audit entries, and the persisted event feed.
///
/// The uniqueness constraints here are the final arbiter for the
/// one-active-run and one-open-proposal invariants; application-level
/// pre-checks only exist to fail fast with a friendlier error.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaseRow {
    pub id: String,
    pub name: String,
    pub status: String,
    pub requires_human: bool,
    pub pause_reason: Option<String>,
    pub autopilot_mode: String,
    pub next_due: Option<String>,
    pub portal_url: Option<String>,
    pub last_portal_status: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunRow {
    pub id: String,
    pub case_id: String,
    pub trigger_type: String,
    pub status: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub error: Option<String>,
    pub is_replay: bool,
    pub replay_of_run_id: Option<String>,
    pub dry_run: bool,
    pub proposal_id: Option<String>,
    pub message_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProposalRow {
    pub id: String,
    pub case_id: String,
    pub trigger_message_id: Option<String>,
    pub action_type: String,
    pub draft_subject: Option<String>,
    pub draft_body: Option<String>,
    pub fee_amount: Option<f64>,
    pub reasoning: serde_json::Value,
    pub confidence: f64,
    pub risk_flags: serde_json::Value,
    pub warnings: serde_json::Value,
    pub can_auto_execute: bool,
    pub requires_human: bool,
    pub pause_reason: Option<String>,
    pub waitpoint_token: Option<String>,
    pub status: String,
    pub decision_action: Option<String>,
    pub decision_instruction: Option<String>,
    pub decision_reason: Option<String>,
    pub decided_at: Option<String>,
    pub decided_by: Option<String>,
    pub adjustment_count: i64,
    pub executed_at: Option<String>,
    pub email_job_id: Option<String>,
    pub created: String,
    pub updated: String,
}

/// Insert payload for a fresh proposal; decision fields start empty.
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub id: String,
    pub case_id: String,
    pub trigger_message_id: Option<String>,
    pub action_type: String,
    pub draft_subject: Option<String>,
    pub draft_body: Option<String>,
    pub fee_amount: Option<f64>,
    pub reasoning: serde_json::Value,
    pub confidence: f64,
    pub risk_flags: serde_json::Value,
    pub warnings: serde_json::Value,
    pub can_auto_execute: bool,
    pub requires_human: bool,
    pub pause_reason: Option<String>,
    pub waitpoint_token: Option<String>,
    pub status: String,
    pub adjustment_count: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClaimRow {
    pub proposal_id: String,
    pub execution_key: String,
    pub claimed_at: String,
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub idem_key: Option<String>,
    pub state: String,
    pub attempts: i64,
    pub error: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DlqRow {
    pub id: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub resolution: String,
    pub resolution_note: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub case_id: Option<String>,
    pub payload: serde_json::Value,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn json_text(v: &serde_json::Value) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "null".to_string())
}

fn parse_json(s: Option<String>) -> serde_json::Value {
    s.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("engine.sqlite");
        let need_init = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        // Pragmas tuned for async server usage
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let busy_ms: u64 = std::env::var("FOIL_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        if need_init {
            Self::init_schema(&conn)?;
        }
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Case fields the engine owns. The full case record lives with
            -- the dashboard; this is the orchestration-relevant subset.
            CREATE TABLE IF NOT EXISTS cases (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              status TEXT NOT NULL,
              requires_human INTEGER NOT NULL DEFAULT 0,
              pause_reason TEXT,
              autopilot_mode TEXT NOT NULL DEFAULT 'supervised',
              next_due TEXT,
              portal_url TEXT,
              last_portal_status TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_log (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              case_id TEXT NOT NULL,
              event_type TEXT NOT NULL,
              description TEXT NOT NULL,
              meta TEXT,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_case ON activity_log(case_id);

            -- Run ledger: one row per orchestration attempt.
            CREATE TABLE IF NOT EXISTS runs (
              id TEXT PRIMARY KEY,
              case_id TEXT NOT NULL,
              trigger_type TEXT NOT NULL,
              status TEXT NOT NULL,
              started_at TEXT,
              ended_at TEXT,
              error TEXT,
              is_replay INTEGER NOT NULL DEFAULT 0,
              replay_of_run_id TEXT,
              dry_run INTEGER NOT NULL DEFAULT 0,
              proposal_id TEXT,
              message_id TEXT,
              metadata TEXT NOT NULL DEFAULT '{}',
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_case ON runs(case_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            -- Final arbiter for the single-active-run invariant.
            CREATE UNIQUE INDEX IF NOT EXISTS runs_one_active
              ON runs(case_id) WHERE status IN ('queued','running','paused');

            -- Proposal ledger: drafted actions awaiting or past a decision.
            CREATE TABLE IF NOT EXISTS proposals (
              id TEXT PRIMARY KEY,
              case_id TEXT NOT NULL,
              trigger_message_id TEXT,
              action_type TEXT NOT NULL,
              draft_subject TEXT,
              draft_body TEXT,
              fee_amount REAL,
              reasoning TEXT NOT NULL DEFAULT '[]',
              confidence REAL NOT NULL DEFAULT 0,
              risk_flags TEXT NOT NULL DEFAULT '[]',
              warnings TEXT NOT NULL DEFAULT '[]',
              can_auto_execute INTEGER NOT NULL DEFAULT 0,
              requires_human INTEGER NOT NULL DEFAULT 1,
              pause_reason TEXT,
              waitpoint_token TEXT,
              status TEXT NOT NULL,
              decision_action TEXT,
              decision_instruction TEXT,
              decision_reason TEXT,
              decided_at TEXT,
              decided_by TEXT,
              adjustment_count INTEGER NOT NULL DEFAULT 0,
              executed_at TEXT,
              email_job_id TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_proposals_case ON proposals(case_id);
            CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);
            -- Final arbiter for the single-open-proposal invariant.
            CREATE UNIQUE INDEX IF NOT EXISTS proposals_one_open
              ON proposals(case_id) WHERE status IN ('pending_approval','blocked');

            -- Execution claims: at-most-once guard for proposal side effects.
            CREATE TABLE IF NOT EXISTS execution_claims (
              proposal_id TEXT PRIMARY KEY,
              execution_key TEXT NOT NULL UNIQUE,
              claimed_at TEXT NOT NULL,
              job_id TEXT
            );

            -- Local execution facility queue.
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              idem_key TEXT UNIQUE,
              state TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              error TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);

            CREATE TABLE IF NOT EXISTS dlq_items (
              id TEXT PRIMARY KEY,
              queue_name TEXT NOT NULL,
              payload TEXT NOT NULL,
              error TEXT NOT NULL,
              resolution TEXT NOT NULL DEFAULT 'pending',
              resolution_note TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dlq_resolution ON dlq_items(resolution);

            CREATE TABLE IF NOT EXISTS reaper_audit (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              swept_at TEXT NOT NULL,
              target_type TEXT NOT NULL,
              target_id TEXT NOT NULL,
              previous_state TEXT NOT NULL,
              new_state TEXT NOT NULL,
              reason TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              case_id TEXT,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_case ON events(case_id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        let busy_ms: u64 = std::env::var("FOIL_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ----- cases -----

    pub fn insert_case(&self, id: &str, name: &str, status: &str, autopilot_mode: &str) -> Result<()> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "INSERT OR IGNORE INTO cases(id,name,status,autopilot_mode,created,updated) VALUES(?,?,?,?,?,?)",
            params![id, name, status, autopilot_mode, ts, ts],
        )?;
        Ok(())
    }

    pub fn get_case(&self, id: &str) -> Result<Option<CaseRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,name,status,requires_human,pause_reason,autopilot_mode,next_due,portal_url,last_portal_status,created,updated FROM cases WHERE id=? LIMIT 1",
        )?;
        let row = stmt
            .query_row([id], |r| {
                Ok(CaseRow {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    status: r.get(2)?,
                    requires_human: r.get::<_, i64>(3)? != 0,
                    pause_reason: r.get(4)?,
                    autopilot_mode: r.get(5)?,
                    next_due: r.get(6)?,
                    portal_url: r.get(7)?,
                    last_portal_status: r.get(8)?,
                    created: r.get(9)?,
                    updated: r.get(10)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Apply a constrained field update. Unknown keys are rejected so the
    /// engine can never scribble over dashboard-owned columns.
    pub fn update_case_fields(&self, id: &str, fields: &serde_json::Value) -> Result<bool> {
        let obj = fields
            .as_object()
            .ok_or_else(|| anyhow!("case update fields must be an object"))?;
        const ALLOWED: [&str; 7] = [
            "status",
            "requires_human",
            "pause_reason",
            "autopilot_mode",
            "next_due",
            "portal_url",
            "last_portal_status",
        ];
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for (key, val) in obj {
            if !ALLOWED.contains(&key.as_str()) {
                return Err(anyhow!("case field not engine-owned: {key}"));
            }
            sets.push(format!("{key}=?"));
            let v = match val {
                serde_json::Value::Null => rusqlite::types::Value::Null,
                serde_json::Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        rusqlite::types::Value::Integer(i)
                    } else {
                        rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
                    }
                }
                serde_json::Value::String(s) => rusqlite::types::Value::Text(s.clone()),
                other => rusqlite::types::Value::Text(json_text(other)),
            };
            values.push(v);
        }
        if sets.is_empty() {
            return Ok(false);
        }
        sets.push("updated=?".into());
        values.push(rusqlite::types::Value::Text(now()));
        values.push(rusqlite::types::Value::Text(id.to_string()));
        let sql = format!("UPDATE cases SET {} WHERE id=?", sets.join(","));
        let conn = self.conn()?;
        let n = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(n > 0)
    }

    pub fn list_cases(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,name,status,requires_human,pause_reason,autopilot_mode,updated FROM cases ORDER BY updated DESC LIMIT ?",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(serde_json::json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "requires_human": r.get::<_, i64>(3)? != 0,
                "pause_reason": r.get::<_, Option<String>>(4)?,
                "autopilot_mode": r.get::<_, String>(5)?,
                "updated": r.get::<_, String>(6)?,
            }));
        }
        Ok(out)
    }

    pub fn append_activity(
        &self,
        case_id: &str,
        event_type: &str,
        description: &str,
        meta: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO activity_log(case_id,event_type,description,meta,created) VALUES(?,?,?,?,?)",
            params![case_id, event_type, description, meta.map(json_text), now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_activity(&self, case_id: &str, limit: i64) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,event_type,description,meta,created FROM activity_log WHERE case_id=? ORDER BY id DESC LIMIT ?",
        )?;
        let mut rows = stmt.query(params![case_id, limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(serde_json::json!({
                "id": r.get::<_, i64>(0)?,
                "event_type": r.get::<_, String>(1)?,
                "description": r.get::<_, String>(2)?,
                "meta": parse_json(r.get::<_, Option<String>>(3)?),
                "created": r.get::<_, String>(4)?,
            }));
        }
        Ok(out)
    }

    // ----- runs -----

    /// Insert a new run. Returns `Ok(false)` when the partial unique index
    /// rejects a second active run for the case (the race the optimistic
    /// pre-check cannot close).
    #[allow(clippy::too_many_arguments)]
    pub fn insert_run(
        &self,
        id: &str,
        case_id: &str,
        trigger_type: &str,
        is_replay: bool,
        replay_of_run_id: Option<&str>,
        dry_run: bool,
        message_id: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let res = conn.execute(
            "INSERT INTO runs(id,case_id,trigger_type,status,is_replay,replay_of_run_id,dry_run,message_id,metadata,created,updated) VALUES(?,?,?,'queued',?,?,?,?,?,?,?)",
            params![
                id,
                case_id,
                trigger_type,
                is_replay as i64,
                replay_of_run_id,
                dry_run as i64,
                message_id,
                json_text(metadata),
                ts,
                ts
            ],
        );
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn run_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
        Ok(RunRow {
            id: r.get(0)?,
            case_id: r.get(1)?,
            trigger_type: r.get(2)?,
            status: r.get(3)?,
            started_at: r.get(4)?,
            ended_at: r.get(5)?,
            error: r.get(6)?,
            is_replay: r.get::<_, i64>(7)? != 0,
            replay_of_run_id: r.get(8)?,
            dry_run: r.get::<_, i64>(9)? != 0,
            proposal_id: r.get(10)?,
            message_id: r.get(11)?,
            metadata: parse_json(r.get::<_, Option<String>>(12)?),
            created: r.get(13)?,
            updated: r.get(14)?,
        })
    }

    const RUN_COLS: &'static str = "id,case_id,trigger_type,status,started_at,ended_at,error,is_replay,replay_of_run_id,dry_run,proposal_id,message_id,metadata,created,updated";

    pub fn get_run(&self, id: &str) -> Result<Option<RunRow>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM runs WHERE id=? LIMIT 1", Self::RUN_COLS);
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.query_row([id], Self::run_from_row).optional()?)
    }

    pub fn find_active_run(&self, case_id: &str) -> Result<Option<RunRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM runs WHERE case_id=? AND status IN ('queued','running','paused') LIMIT 1",
            Self::RUN_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.query_row([case_id], Self::run_from_row).optional()?)
    }

    /// Transition a run's lifecycle state, stamping started_at/ended_at as
    /// appropriate. Terminal stamps are idempotent (COALESCE keeps the first).
    pub fn set_run_status(&self, id: &str, status: &str, error: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let n = match status {
            "running" => conn.execute(
                "UPDATE runs SET status='running', started_at=COALESCE(started_at,?), updated=? WHERE id=?",
                params![ts, ts, id],
            )?,
            "completed" | "failed" => conn.execute(
                "UPDATE runs SET status=?, ended_at=COALESCE(ended_at,?), error=COALESCE(?,error), updated=? WHERE id=?",
                params![status, ts, error, ts, id],
            )?,
            _ => conn.execute(
                "UPDATE runs SET status=?, error=COALESCE(?,error), updated=? WHERE id=?",
                params![status, error, ts, id],
            )?,
        };
        Ok(n > 0)
    }

    pub fn set_run_proposal(&self, id: &str, proposal_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE runs SET proposal_id=?, updated=? WHERE id=?",
            params![proposal_id, now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn update_run_metadata(&self, id: &str, metadata: &serde_json::Value) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE runs SET metadata=?, updated=? WHERE id=?",
            params![json_text(metadata), now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn list_runs(
        &self,
        case_id: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<RunRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM runs WHERE (?1 IS NULL OR case_id=?1) AND (?2 IS NULL OR status=?2) ORDER BY created DESC LIMIT ?3",
            Self::RUN_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![case_id, status, limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(Self::run_from_row(r)?);
        }
        Ok(out)
    }

    /// Runs still non-terminal whose last update predates the cutoff.
    /// Dry-run replays are excluded at the query: failing a simulation that
    /// sat around helps nobody.
    pub fn list_stale_runs(&self, cutoff: &str) -> Result<Vec<RunRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM runs WHERE status IN ('running','paused') AND dry_run=0 AND updated < ? ORDER BY updated ASC",
            Self::RUN_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([cutoff])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(Self::run_from_row(r)?);
        }
        Ok(out)
    }

    // ----- proposals -----

    /// Insert a proposal. Returns `Ok(false)` when the one-open-proposal
    /// index rejects a second pending/blocked proposal for the case.
    pub fn insert_proposal(&self, p: &NewProposal) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let res = conn.execute(
            "INSERT INTO proposals(id,case_id,trigger_message_id,action_type,draft_subject,draft_body,fee_amount,reasoning,confidence,risk_flags,warnings,can_auto_execute,requires_human,pause_reason,waitpoint_token,status,adjustment_count,created,updated) \
             VALUES(?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
            params![
                p.id,
                p.case_id,
                p.trigger_message_id,
                p.action_type,
                p.draft_subject,
                p.draft_body,
                p.fee_amount,
                json_text(&p.reasoning),
                p.confidence,
                json_text(&p.risk_flags),
                json_text(&p.warnings),
                p.can_auto_execute as i64,
                p.requires_human as i64,
                p.pause_reason,
                p.waitpoint_token,
                p.status,
                p.adjustment_count,
                ts,
                ts
            ],
        );
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn proposal_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ProposalRow> {
        Ok(ProposalRow {
            id: r.get(0)?,
            case_id: r.get(1)?,
            trigger_message_id: r.get(2)?,
            action_type: r.get(3)?,
            draft_subject: r.get(4)?,
            draft_body: r.get(5)?,
            fee_amount: r.get(6)?,
            reasoning: parse_json(r.get::<_, Option<String>>(7)?),
            confidence: r.get(8)?,
            risk_flags: parse_json(r.get::<_, Option<String>>(9)?),
            warnings: parse_json(r.get::<_, Option<String>>(10)?),
            can_auto_execute: r.get::<_, i64>(11)? != 0,
            requires_human: r.get::<_, i64>(12)? != 0,
            pause_reason: r.get(13)?,
            waitpoint_token: r.get(14)?,
            status: r.get(15)?,
            decision_action: r.get(16)?,
            decision_instruction: r.get(17)?,
            decision_reason: r.get(18)?,
            decided_at: r.get(19)?,
            decided_by: r.get(20)?,
            adjustment_count: r.get(21)?,
            executed_at: r.get(22)?,
            email_job_id: r.get(23)?,
            created: r.get(24)?,
            updated: r.get(25)?,
        })
    }

    const PROPOSAL_COLS: &'static str = "id,case_id,trigger_message_id,action_type,draft_subject,draft_body,fee_amount,reasoning,confidence,risk_flags,warnings,can_auto_execute,requires_human,pause_reason,waitpoint_token,status,decision_action,decision_instruction,decision_reason,decided_at,decided_by,adjustment_count,executed_at,email_job_id,created,updated";

    pub fn get_proposal(&self, id: &str) -> Result<Option<ProposalRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM proposals WHERE id=? LIMIT 1",
            Self::PROPOSAL_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.query_row([id], Self::proposal_from_row).optional()?)
    }

    pub fn find_open_proposal(&self, case_id: &str) -> Result<Option<ProposalRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM proposals WHERE case_id=? AND status IN ('pending_approval','blocked') LIMIT 1",
            Self::PROPOSAL_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt
            .query_row([case_id], Self::proposal_from_row)
            .optional()?)
    }

    pub fn set_proposal_status(&self, id: &str, status: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE proposals SET status=?, updated=? WHERE id=?",
            params![status, now(), id],
        )?;
        Ok(n > 0)
    }

    /// Record a human decision. Only touches the row when it is still in the
    /// expected prior status, so a stale caller cannot clobber a later state.
    #[allow(clippy::too_many_arguments)]
    pub fn record_decision(
        &self,
        id: &str,
        expected_status: &str,
        new_status: &str,
        action: &str,
        instruction: Option<&str>,
        reason: Option<&str>,
        decided_by: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let n = conn.execute(
            "UPDATE proposals SET status=?, decision_action=?, decision_instruction=?, decision_reason=?, decided_at=?, decided_by=?, updated=? WHERE id=? AND status=?",
            params![
                new_status,
                action,
                instruction,
                reason,
                ts,
                decided_by,
                ts,
                id,
                expected_status
            ],
        )?;
        Ok(n > 0)
    }

    pub fn mark_proposal_executed(&self, id: &str, email_job_id: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let n = conn.execute(
            "UPDATE proposals SET status='executed', executed_at=?, email_job_id=?, updated=? WHERE id=?",
            params![ts, email_job_id, ts, id],
        )?;
        Ok(n > 0)
    }

    /// Cancel any open proposals when a case is withdrawn.
    pub fn cancel_open_proposals(&self, case_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE proposals SET status='cancelled', updated=? WHERE case_id=? AND status IN ('pending_approval','blocked')",
            params![now(), case_id],
        )?;
        Ok(n as i64)
    }

    pub fn list_proposals(
        &self,
        case_id: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ProposalRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM proposals WHERE (?1 IS NULL OR case_id=?1) AND (?2 IS NULL OR status=?2) ORDER BY created DESC LIMIT ?3",
            Self::PROPOSAL_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![case_id, status, limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(Self::proposal_from_row(r)?);
        }
        Ok(out)
    }

    // ----- execution claims -----

    /// Atomically claim a proposal's side effect. `Ok(false)` means another
    /// caller holds the claim; never treat that as retryable.
    pub fn insert_claim(&self, proposal_id: &str, execution_key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let res = conn.execute(
            "INSERT INTO execution_claims(proposal_id,execution_key,claimed_at) VALUES(?,?,?)",
            params![proposal_id, execution_key, now()],
        );
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_claim(&self, proposal_id: &str) -> Result<Option<ClaimRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT proposal_id,execution_key,claimed_at,job_id FROM execution_claims WHERE proposal_id=? LIMIT 1",
        )?;
        let row = stmt
            .query_row([proposal_id], |r| {
                Ok(ClaimRow {
                    proposal_id: r.get(0)?,
                    execution_key: r.get(1)?,
                    claimed_at: r.get(2)?,
                    job_id: r.get(3)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn set_claim_job(&self, proposal_id: &str, job_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE execution_claims SET job_id=? WHERE proposal_id=?",
            params![job_id, proposal_id],
        )?;
        Ok(n > 0)
    }

    pub fn count_claims(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT COUNT(1) FROM execution_claims")?;
        Ok(stmt.query_row([], |r| r.get(0))?)
    }

    // ----- jobs (local execution facility) -----

    /// Insert a job. `Ok(false)` means the idempotency key already exists;
    /// fetch the prior job handle instead of enqueuing a duplicate.
    pub fn insert_job(
        &self,
        id: &str,
        kind: &str,
        payload: &serde_json::Value,
        idem_key: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let res = conn.execute(
            "INSERT INTO jobs(id,kind,payload,idem_key,state,created,updated) VALUES(?,?,?,?,'queued',?,?)",
            params![id, kind, json_text(payload), idem_key, ts, ts],
        );
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn find_job_by_idem(&self, idem: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM jobs WHERE idem_key=? LIMIT 1")?;
        let id: Option<String> = stmt.query_row([idem], |r| r.get(0)).optional()?;
        Ok(id)
    }

    fn job_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
        Ok(JobRow {
            id: r.get(0)?,
            kind: r.get(1)?,
            payload: parse_json(r.get::<_, Option<String>>(2)?),
            idem_key: r.get(3)?,
            state: r.get(4)?,
            attempts: r.get(5)?,
            error: r.get(6)?,
            created: r.get(7)?,
            updated: r.get(8)?,
        })
    }

    const JOB_COLS: &'static str = "id,kind,payload,idem_key,state,attempts,error,created,updated";

    pub fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM jobs WHERE id=? LIMIT 1", Self::JOB_COLS);
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.query_row([id], Self::job_from_row).optional()?)
    }

    /// Claim the oldest queued job: flips it to running and bumps attempts in
    /// one statement so two workers can never claim the same job.
    pub fn dequeue_one_queued(&self) -> Result<Option<JobRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE jobs SET state='running', attempts=attempts+1, updated=? WHERE id = (
                 SELECT id FROM jobs WHERE state='queued' ORDER BY created LIMIT 1
             ) RETURNING {}",
            Self::JOB_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![now()])?;
        if let Some(r) = rows.next()? {
            return Ok(Some(Self::job_from_row(r)?));
        }
        Ok(None)
    }

    pub fn set_job_state(&self, id: &str, state: &str, error: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET state=?, error=COALESCE(?,error), updated=? WHERE id=?",
            params![state, error, now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn requeue_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET state='queued', updated=? WHERE id=?",
            params![now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn count_jobs_by_state(&self, state: &str) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT COUNT(1) FROM jobs WHERE state=?")?;
        Ok(stmt.query_row([state], |r| r.get(0))?)
    }

    pub fn list_jobs_by_kind(&self, kind: &str, limit: i64) -> Result<Vec<JobRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE kind=? ORDER BY created DESC LIMIT ?",
            Self::JOB_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![kind, limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(Self::job_from_row(r)?);
        }
        Ok(out)
    }

    pub fn list_stale_jobs(&self, cutoff: &str) -> Result<Vec<JobRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE state='running' AND updated < ? ORDER BY updated ASC",
            Self::JOB_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([cutoff])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(Self::job_from_row(r)?);
        }
        Ok(out)
    }

    // ----- dead-letter queue -----

    pub fn insert_dlq(
        &self,
        id: &str,
        queue_name: &str,
        payload: &serde_json::Value,
        error: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO dlq_items(id,queue_name,payload,error,resolution,created,updated) VALUES(?,?,?,?,'pending',?,?)",
            params![id, queue_name, json_text(payload), error, ts, ts],
        )?;
        Ok(())
    }

    pub fn get_dlq(&self, id: &str) -> Result<Option<DlqRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,queue_name,payload,error,resolution,resolution_note,created,updated FROM dlq_items WHERE id=? LIMIT 1",
        )?;
        let row = stmt
            .query_row([id], |r| {
                Ok(DlqRow {
                    id: r.get(0)?,
                    queue_name: r.get(1)?,
                    payload: parse_json(r.get::<_, Option<String>>(2)?),
                    error: r.get(3)?,
                    resolution: r.get(4)?,
                    resolution_note: r.get(5)?,
                    created: r.get(6)?,
                    updated: r.get(7)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn list_dlq(
        &self,
        queue_name: Option<&str>,
        resolution: Option<&str>,
        limit: i64,
    ) -> Result<Vec<DlqRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,queue_name,payload,error,resolution,resolution_note,created,updated FROM dlq_items \
             WHERE (?1 IS NULL OR queue_name=?1) AND (?2 IS NULL OR resolution=?2) \
             ORDER BY created DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query(params![queue_name, resolution, limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(DlqRow {
                id: r.get(0)?,
                queue_name: r.get(1)?,
                payload: parse_json(r.get::<_, Option<String>>(2)?),
                error: r.get(3)?,
                resolution: r.get(4)?,
                resolution_note: r.get(5)?,
                created: r.get(6)?,
                updated: r.get(7)?,
            });
        }
        Ok(out)
    }

    /// Resolve a pending item. Only pending items move, which makes operator
    /// retries idempotent.
    pub fn set_dlq_resolution(
        &self,
        id: &str,
        resolution: &str,
        note: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE dlq_items SET resolution=?, resolution_note=?, updated=? WHERE id=? AND resolution='pending'",
            params![resolution, note, now(), id],
        )?;
        Ok(n > 0)
    }

    // ----- reaper audit -----

    pub fn append_reaper_audit(
        &self,
        target_type: &str,
        target_id: &str,
        previous_state: &str,
        new_state: &str,
        reason: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reaper_audit(swept_at,target_type,target_id,previous_state,new_state,reason) VALUES(?,?,?,?,?,?)",
            params![now(), target_type, target_id, previous_state, new_state, reason],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_reaper_audit(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,swept_at,target_type,target_id,previous_state,new_state,reason FROM reaper_audit ORDER BY id DESC LIMIT ?",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(serde_json::json!({
                "id": r.get::<_, i64>(0)?,
                "swept_at": r.get::<_, String>(1)?,
                "target_type": r.get::<_, String>(2)?,
                "target_id": r.get::<_, String>(3)?,
                "previous_state": r.get::<_, String>(4)?,
                "new_state": r.get::<_, String>(5)?,
                "reason": r.get::<_, String>(6)?,
            }));
        }
        Ok(out)
    }

    pub fn count_reaper_audit(&self) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT COUNT(1) FROM reaper_audit")?;
        Ok(stmt.query_row([], |r| r.get(0))?)
    }

    // ----- events -----

    pub fn append_event(&self, env: &foil_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let case_id = env
            .payload
            .get("case_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        conn.execute(
            "INSERT INTO events(time,kind,case_id,payload) VALUES(?,?,?,?)",
            params![env.time, env.kind, case_id, json_text(&env.payload)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_events(&self, limit: i64, after_id: Option<i64>) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt_after;
        let mut stmt_all;
        let mut rows = if let Some(aid) = after_id {
            stmt_after = conn.prepare(
                "SELECT id,time,kind,case_id,payload FROM events WHERE id>? ORDER BY id ASC LIMIT ?",
            )?;
            stmt_after.query(params![aid, limit])?
        } else {
            stmt_all = conn
                .prepare("SELECT id,time,kind,case_id,payload FROM events ORDER BY id DESC LIMIT ?")?;
            stmt_all.query(params![limit])?
        };
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(EventRow {
                id: r.get(0)?,
                time: r.get(1)?,
                kind: r.get(2)?,
                case_id: r.get(3)?,
                payload: parse_json(r.get::<_, Option<String>>(4)?),
            });
        }
        // Ensure ascending order for replay
        if after_id.is_none() {
            out.reverse();
        }
        Ok(out)
    }
}

// Async wrappers: the server is async throughout, the kernel is not.
// Same shape as a blocking call, hopped onto the blocking pool.
macro_rules! blocking {
    ($self:ident, $body:expr) => {{
        let k = $self.clone();
        tokio::task::spawn_blocking(move || $body(k))
            .await
            .map_err(|e| anyhow!("join error: {e}"))?
    }};
}

impl Kernel {
    pub async fn get_case_async(&self, id: String) -> Result<Option<CaseRow>> {
        blocking!(self, move |k: Kernel| k.get_case(&id))
    }

    pub async fn insert_case_async(
        &self,
        id: String,
        name: String,
        status: String,
        autopilot_mode: String,
    ) -> Result<()> {
        blocking!(self, move |k: Kernel| k.insert_case(
            &id,
            &name,
            &status,
            &autopilot_mode
        ))
    }

    pub async fn update_case_fields_async(
        &self,
        id: String,
        fields: serde_json::Value,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.update_case_fields(&id, &fields))
    }

    pub async fn list_cases_async(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        blocking!(self, move |k: Kernel| k.list_cases(limit))
    }

    pub async fn append_activity_async(
        &self,
        case_id: String,
        event_type: String,
        description: String,
        meta: Option<serde_json::Value>,
    ) -> Result<i64> {
        blocking!(self, move |k: Kernel| k.append_activity(
            &case_id,
            &event_type,
            &description,
            meta.as_ref()
        ))
    }

    pub async fn list_activity_async(
        &self,
        case_id: String,
        limit: i64,
    ) -> Result<Vec<serde_json::Value>> {
        blocking!(self, move |k: Kernel| k.list_activity(&case_id, limit))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_run_async(
        &self,
        id: String,
        case_id: String,
        trigger_type: String,
        is_replay: bool,
        replay_of_run_id: Option<String>,
        dry_run: bool,
        message_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.insert_run(
            &id,
            &case_id,
            &trigger_type,
            is_replay,
            replay_of_run_id.as_deref(),
            dry_run,
            message_id.as_deref(),
            &metadata
        ))
    }

    pub async fn get_run_async(&self, id: String) -> Result<Option<RunRow>> {
        blocking!(self, move |k: Kernel| k.get_run(&id))
    }

    pub async fn find_active_run_async(&self, case_id: String) -> Result<Option<RunRow>> {
        blocking!(self, move |k: Kernel| k.find_active_run(&case_id))
    }

    pub async fn set_run_status_async(
        &self,
        id: String,
        status: String,
        error: Option<String>,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.set_run_status(
            &id,
            &status,
            error.as_deref()
        ))
    }

    pub async fn set_run_proposal_async(&self, id: String, proposal_id: String) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.set_run_proposal(&id, &proposal_id))
    }

    pub async fn update_run_metadata_async(
        &self,
        id: String,
        metadata: serde_json::Value,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.update_run_metadata(&id, &metadata))
    }

    pub async fn list_runs_async(
        &self,
        case_id: Option<String>,
        status: Option<String>,
        limit: i64,
    ) -> Result<Vec<RunRow>> {
        blocking!(self, move |k: Kernel| k.list_runs(
            case_id.as_deref(),
            status.as_deref(),
            limit
        ))
    }

    pub async fn list_stale_runs_async(&self, cutoff: String) -> Result<Vec<RunRow>> {
        blocking!(self, move |k: Kernel| k.list_stale_runs(&cutoff))
    }

    pub async fn insert_proposal_async(&self, p: NewProposal) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.insert_proposal(&p))
    }

    pub async fn get_proposal_async(&self, id: String) -> Result<Option<ProposalRow>> {
        blocking!(self, move |k: Kernel| k.get_proposal(&id))
    }

    pub async fn find_open_proposal_async(&self, case_id: String) -> Result<Option<ProposalRow>> {
        blocking!(self, move |k: Kernel| k.find_open_proposal(&case_id))
    }

    pub async fn set_proposal_status_async(&self, id: String, status: String) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.set_proposal_status(&id, &status))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_decision_async(
        &self,
        id: String,
        expected_status: String,
        new_status: String,
        action: String,
        instruction: Option<String>,
        reason: Option<String>,
        decided_by: Option<String>,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.record_decision(
            &id,
            &expected_status,
            &new_status,
            &action,
            instruction.as_deref(),
            reason.as_deref(),
            decided_by.as_deref()
        ))
    }

    pub async fn mark_proposal_executed_async(
        &self,
        id: String,
        email_job_id: Option<String>,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.mark_proposal_executed(
            &id,
            email_job_id.as_deref()
        ))
    }

    pub async fn cancel_open_proposals_async(&self, case_id: String) -> Result<i64> {
        blocking!(self, move |k: Kernel| k.cancel_open_proposals(&case_id))
    }

    pub async fn list_proposals_async(
        &self,
        case_id: Option<String>,
        status: Option<String>,
        limit: i64,
    ) -> Result<Vec<ProposalRow>> {
        blocking!(self, move |k: Kernel| k.list_proposals(
            case_id.as_deref(),
            status.as_deref(),
            limit
        ))
    }

    pub async fn insert_claim_async(
        &self,
        proposal_id: String,
        execution_key: String,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.insert_claim(
            &proposal_id,
            &execution_key
        ))
    }

    pub async fn get_claim_async(&self, proposal_id: String) -> Result<Option<ClaimRow>> {
        blocking!(self, move |k: Kernel| k.get_claim(&proposal_id))
    }

    pub async fn set_claim_job_async(&self, proposal_id: String, job_id: String) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.set_claim_job(&proposal_id, &job_id))
    }

    pub async fn insert_job_async(
        &self,
        id: String,
        kind: String,
        payload: serde_json::Value,
        idem_key: Option<String>,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.insert_job(
            &id,
            &kind,
            &payload,
            idem_key.as_deref()
        ))
    }

    pub async fn find_job_by_idem_async(&self, idem: String) -> Result<Option<String>> {
        blocking!(self, move |k: Kernel| k.find_job_by_idem(&idem))
    }

    pub async fn get_job_async(&self, id: String) -> Result<Option<JobRow>> {
        blocking!(self, move |k: Kernel| k.get_job(&id))
    }

    pub async fn dequeue_one_queued_async(&self) -> Result<Option<JobRow>> {
        blocking!(self, move |k: Kernel| k.dequeue_one_queued())
    }

    pub async fn set_job_state_async(
        &self,
        id: String,
        state: String,
        error: Option<String>,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.set_job_state(
            &id,
            &state,
            error.as_deref()
        ))
    }

    pub async fn requeue_job_async(&self, id: String) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.requeue_job(&id))
    }

    pub async fn count_jobs_by_state_async(&self, state: String) -> Result<i64> {
        blocking!(self, move |k: Kernel| k.count_jobs_by_state(&state))
    }

    pub async fn list_stale_jobs_async(&self, cutoff: String) -> Result<Vec<JobRow>> {
        blocking!(self, move |k: Kernel| k.list_stale_jobs(&cutoff))
    }

    pub async fn insert_dlq_async(
        &self,
        id: String,
        queue_name: String,
        payload: serde_json::Value,
        error: String,
    ) -> Result<()> {
        blocking!(self, move |k: Kernel| k.insert_dlq(
            &id,
            &queue_name,
            &payload,
            &error
        ))
    }

    pub async fn get_dlq_async(&self, id: String) -> Result<Option<DlqRow>> {
        blocking!(self, move |k: Kernel| k.get_dlq(&id))
    }

    pub async fn list_dlq_async(
        &self,
        queue_name: Option<String>,
        resolution: Option<String>,
        limit: i64,
    ) -> Result<Vec<DlqRow>> {
        blocking!(self, move |k: Kernel| k.list_dlq(
            queue_name.as_deref(),
            resolution.as_deref(),
            limit
        ))
    }

    pub async fn set_dlq_resolution_async(
        &self,
        id: String,
        resolution: String,
        note: Option<String>,
    ) -> Result<bool> {
        blocking!(self, move |k: Kernel| k.set_dlq_resolution(
            &id,
            &resolution,
            note.as_deref()
        ))
    }

    pub async fn append_reaper_audit_async(
        &self,
        target_type: String,
        target_id: String,
        previous_state: String,
        new_state: String,
        reason: String,
    ) -> Result<i64> {
        blocking!(self, move |k: Kernel| k.append_reaper_audit(
            &target_type,
            &target_id,
            &previous_state,
            &new_state,
            &reason
        ))
    }

    pub async fn list_reaper_audit_async(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        blocking!(self, move |k: Kernel| k.list_reaper_audit(limit))
    }

    pub async fn append_event_async(&self, env: foil_events::Envelope) -> Result<i64> {
        blocking!(self, move |k: Kernel| k.append_event(&env))
    }

    pub async fn recent_events_async(
        &self,
        limit: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<EventRow>> {
        blocking!(self, move |k: Kernel| k.recent_events(limit, after_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempdir().expect("tempdir");
        let k = Kernel::open(dir.path()).expect("open kernel");
        (dir, k)
    }

    fn minimal_proposal(id: &str, case_id: &str, status: &str) -> NewProposal {
        NewProposal {
            id: id.into(),
            case_id: case_id.into(),
            trigger_message_id: None,
            action_type: "send_followup".into(),
            draft_subject: Some("Re: request".into()),
            draft_body: Some("following up".into()),
            fee_amount: None,
            reasoning: json!(["no reply in 30 days"]),
            confidence: 0.8,
            risk_flags: json!([]),
            warnings: json!([]),
            can_auto_execute: false,
            requires_human: true,
            pause_reason: Some("awaiting_approval".into()),
            waitpoint_token: None,
            status: status.into(),
            adjustment_count: 0,
        }
    }

    #[test]
    fn second_active_run_is_rejected_by_constraint() {
        let (_dir, k) = kernel();
        assert!(k
            .insert_run("r1", "c1", "initial_request", false, None, false, None, &json!({}))
            .unwrap());
        // Same case, still active: the partial unique index must refuse it.
        assert!(!k
            .insert_run("r2", "c1", "manual", false, None, false, None, &json!({}))
            .unwrap());
        // Different case is fine.
        assert!(k
            .insert_run("r3", "c2", "manual", false, None, false, None, &json!({}))
            .unwrap());
        // Once the first run is terminal, the slot frees up.
        assert!(k.set_run_status("r1", "failed", Some("cancelled")).unwrap());
        assert!(k
            .insert_run("r4", "c1", "retry", false, None, false, None, &json!({}))
            .unwrap());
    }

    #[test]
    fn paused_run_still_occupies_the_slot() {
        let (_dir, k) = kernel();
        assert!(k
            .insert_run("r1", "c1", "inbound_message", false, None, false, None, &json!({}))
            .unwrap());
        assert!(k.set_run_status("r1", "running", None).unwrap());
        assert!(k.set_run_status("r1", "paused", None).unwrap());
        assert!(!k
            .insert_run("r2", "c1", "followup_trigger", false, None, false, None, &json!({}))
            .unwrap());
        let active = k.find_active_run("c1").unwrap().expect("active run");
        assert_eq!(active.id, "r1");
        assert_eq!(active.status, "paused");
        assert!(active.started_at.is_some());
    }

    #[test]
    fn terminal_run_stamps_ended_at_once() {
        let (_dir, k) = kernel();
        k.insert_run("r1", "c1", "manual", false, None, false, None, &json!({}))
            .unwrap();
        k.set_run_status("r1", "running", None).unwrap();
        k.set_run_status("r1", "completed", None).unwrap();
        let first = k.get_run("r1").unwrap().unwrap().ended_at.unwrap();
        k.set_run_status("r1", "completed", None).unwrap();
        let second = k.get_run("r1").unwrap().unwrap().ended_at.unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn only_one_open_proposal_per_case() {
        let (_dir, k) = kernel();
        assert!(k
            .insert_proposal(&minimal_proposal("p1", "c1", "pending_approval"))
            .unwrap());
        assert!(!k
            .insert_proposal(&minimal_proposal("p2", "c1", "pending_approval"))
            .unwrap());
        assert!(!k
            .insert_proposal(&minimal_proposal("p3", "c1", "blocked"))
            .unwrap());
        // Terminal proposals never collide.
        assert!(k
            .insert_proposal(&minimal_proposal("p4", "c1", "dismissed"))
            .unwrap());
        let open = k.find_open_proposal("c1").unwrap().expect("open proposal");
        assert_eq!(open.id, "p1");
    }

    #[test]
    fn decision_only_applies_from_expected_status() {
        let (_dir, k) = kernel();
        k.insert_proposal(&minimal_proposal("p1", "c1", "pending_approval"))
            .unwrap();
        assert!(k
            .record_decision(
                "p1",
                "pending_approval",
                "decision_received",
                "approve",
                None,
                None,
                Some("ops@example.org"),
            )
            .unwrap());
        // A second (stale) decision must not take.
        assert!(!k
            .record_decision(
                "p1",
                "pending_approval",
                "dismissed",
                "dismiss",
                None,
                None,
                None,
            )
            .unwrap());
        let p = k.get_proposal("p1").unwrap().unwrap();
        assert_eq!(p.status, "decision_received");
        assert_eq!(p.decision_action.as_deref(), Some("approve"));
        assert!(p.decided_at.is_some());
    }

    #[test]
    fn claims_are_exactly_once() {
        let (_dir, k) = kernel();
        assert!(k.insert_claim("p1", "key-1").unwrap());
        assert!(!k.insert_claim("p1", "key-2").unwrap());
        // Reused execution key fails closed as well.
        assert!(!k.insert_claim("p2", "key-1").unwrap());
        assert_eq!(k.count_claims().unwrap(), 1);
        let claim = k.get_claim("p1").unwrap().unwrap();
        assert_eq!(claim.execution_key, "key-1");
    }

    #[test]
    fn job_idempotency_key_dedupes() {
        let (_dir, k) = kernel();
        assert!(k.insert_job("j1", "email.send", &json!({}), Some("idem-1")).unwrap());
        assert!(!k.insert_job("j2", "email.send", &json!({}), Some("idem-1")).unwrap());
        assert_eq!(k.find_job_by_idem("idem-1").unwrap().as_deref(), Some("j1"));
    }

    #[test]
    fn dequeue_claims_and_bumps_attempts() {
        let (_dir, k) = kernel();
        k.insert_job("j1", "case.process", &json!({"case_id":"c1"}), None)
            .unwrap();
        let job = k.dequeue_one_queued().unwrap().expect("job");
        assert_eq!(job.id, "j1");
        assert_eq!(job.state, "running");
        assert_eq!(job.attempts, 1);
        assert!(k.dequeue_one_queued().unwrap().is_none());
        k.requeue_job("j1").unwrap();
        let again = k.dequeue_one_queued().unwrap().expect("job again");
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn dlq_resolution_is_idempotent() {
        let (_dir, k) = kernel();
        k.insert_dlq("d1", "email.send", &json!({"proposal_id":"p1"}), "smtp timeout")
            .unwrap();
        assert!(k
            .set_dlq_resolution("d1", "retried", None)
            .unwrap());
        assert!(!k
            .set_dlq_resolution("d1", "discarded", Some("duplicate"))
            .unwrap());
        let item = k.get_dlq("d1").unwrap().unwrap();
        assert_eq!(item.resolution, "retried");
        assert!(item.resolution_note.is_none());
    }

    #[test]
    fn dlq_discard_keeps_the_operator_note() {
        let (_dir, k) = kernel();
        k.insert_dlq("d2", "portal.sync", &json!({}), "portal 500")
            .unwrap();
        assert!(k
            .set_dlq_resolution("d2", "discarded", Some("portal retired"))
            .unwrap());
        let item = k.get_dlq("d2").unwrap().unwrap();
        assert_eq!(item.resolution, "discarded");
        assert_eq!(item.resolution_note.as_deref(), Some("portal retired"));
    }

    #[test]
    fn stale_run_listing_respects_cutoff() {
        let (_dir, k) = kernel();
        k.insert_run("r1", "c1", "manual", false, None, false, None, &json!({}))
            .unwrap();
        k.set_run_status("r1", "running", None).unwrap();
        let future = "9999-01-01T00:00:00.000Z";
        let past = "2000-01-01T00:00:00.000Z";
        assert_eq!(k.list_stale_runs(future).unwrap().len(), 1);
        assert_eq!(k.list_stale_runs(past).unwrap().len(), 0);
        k.set_run_status("r1", "completed", None).unwrap();
        assert_eq!(k.list_stale_runs(future).unwrap().len(), 0);
    }

    #[test]
    fn case_update_rejects_foreign_fields() {
        let (_dir, k) = kernel();
        k.insert_case("c1", "Records req", "active", "supervised")
            .unwrap();
        assert!(k
            .update_case_fields("c1", &json!({"requires_human": true, "pause_reason": "fee_review"}))
            .unwrap());
        let case = k.get_case("c1").unwrap().unwrap();
        assert!(case.requires_human);
        assert_eq!(case.pause_reason.as_deref(), Some("fee_review"));
        assert!(k
            .update_case_fields("c1", &json!({"owner_email": "x@y"}))
            .is_err());
    }

    #[test]
    fn events_round_trip_through_the_ledger() {
        let (_dir, k) = kernel();
        let env = foil_events::Envelope {
            time: "2026-01-01T00:00:00.000Z".into(),
            kind: "runs.created".into(),
            payload: json!({"case_id": "c1", "id": "r1"}),
        };
        k.append_event(&env).unwrap();
        let events = k.recent_events(10, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "runs.created");
        assert_eq!(events[0].case_id.as_deref(), Some("c1"));
    }
}
