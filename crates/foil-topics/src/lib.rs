//! Canonical event topic constants shared across the engine.
//!
//! Centralizing the strings keeps producers and the dashboard feed in sync.
//! Keep this list alphabetized within sections and favor dot.case names.

// Runs
pub const TOPIC_RUNS_CANCELLED: &str = "runs.cancelled";
pub const TOPIC_RUNS_COMPLETED: &str = "runs.completed";
pub const TOPIC_RUNS_CREATED: &str = "runs.created";
pub const TOPIC_RUNS_FAILED: &str = "runs.failed";
pub const TOPIC_RUNS_PAUSED: &str = "runs.paused";
pub const TOPIC_RUNS_RUNNING: &str = "runs.running";

// Proposals
pub const TOPIC_PROPOSALS_BLOCKED: &str = "proposals.blocked";
pub const TOPIC_PROPOSALS_CREATED: &str = "proposals.created";
pub const TOPIC_PROPOSALS_DECIDED: &str = "proposals.decided";
pub const TOPIC_PROPOSALS_EXECUTED: &str = "proposals.executed";

// Cases
pub const TOPIC_CASES_ACTIVITY: &str = "cases.activity";
pub const TOPIC_CASES_TRANSITIONED: &str = "cases.transitioned";

// Jobs / execution facility
pub const TOPIC_JOBS_COMPLETED: &str = "jobs.completed";
pub const TOPIC_JOBS_DEAD: &str = "jobs.dead";
pub const TOPIC_JOBS_SUBMITTED: &str = "jobs.submitted";
pub const TOPIC_WAITPOINT_COMPLETED: &str = "jobs.waitpoint.completed";

// Policy
pub const TOPIC_POLICY_DECISION: &str = "policy.decision";

// Dead-letter queue / reaper
pub const TOPIC_DLQ_DISCARDED: &str = "dlq.discarded";
pub const TOPIC_DLQ_RECORDED: &str = "dlq.recorded";
pub const TOPIC_DLQ_RETRIED: &str = "dlq.retried";
pub const TOPIC_REAPER_SWEPT: &str = "reaper.swept";

// Service
pub const TOPIC_SERVICE_HEALTH: &str = "service.health";
