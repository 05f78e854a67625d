//! SurrealDB schema migrations and initialization
//!
//! Unique indexes carry the store guarantees that must hold across
//! processes: one task per slug, one round per number, one agent run per
//! idempotency key, one consensus per round, one live claim per slot.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all debate tables.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing debate schema");

    init_tasks_table(db).await?;
    init_rounds_table(db).await?;
    init_agent_runs_table(db).await?;
    init_consensus_table(db).await?;
    init_coordination_tables(db).await?;
    init_events_table(db).await?;

    info!("Debate schema initialization complete");
    Ok(())
}

/// `tasks`: slug is unique; status is indexed for listing by stage.
async fn init_tasks_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tasks table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS tasks SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_task_id ON TABLE tasks COLUMNS task_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_task_slug ON TABLE tasks COLUMNS slug UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_task_status ON TABLE tasks COLUMNS status;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `rounds`: `(task_id, round_number)` is unique.
async fn init_rounds_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing rounds table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS rounds SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_round_id ON TABLE rounds COLUMNS round_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_round_task_number ON TABLE rounds COLUMNS task_id, round_number UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `agent_runs` and `findings`.
///
/// Findings are append-only; they are written in the same transaction that
/// moves their run to a terminal status.
async fn init_agent_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing agent_runs and findings tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agent_runs SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_agent_run_id ON TABLE agent_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_agent_run_key ON TABLE agent_runs COLUMNS idempotency_key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_agent_run_round_role ON TABLE agent_runs COLUMNS round_id, role, status;

        DEFINE TABLE IF NOT EXISTS findings SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_finding_id ON TABLE findings COLUMNS finding_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_finding_run ON TABLE findings COLUMNS run_id, ordinal;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `consensus`: at most one row per round, never updated.
async fn init_consensus_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing consensus table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS consensus SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_consensus_round ON TABLE consensus COLUMNS round_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_consensus_task ON TABLE consensus COLUMNS task_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `claims`, `completion_markers`, `task_leases`, `contexts`.
async fn init_coordination_tables(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing coordination tables");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS claims SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_claim_lock ON TABLE claims COLUMNS lock_key UNIQUE;

        DEFINE TABLE IF NOT EXISTS completion_markers SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;
        DEFINE INDEX IF NOT EXISTS idx_marker_key ON TABLE completion_markers COLUMNS idempotency_key UNIQUE;

        DEFINE TABLE IF NOT EXISTS task_leases SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_lease_task ON TABLE task_leases COLUMNS task_id UNIQUE;

        DEFINE TABLE IF NOT EXISTS contexts SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_context_digest ON TABLE contexts COLUMNS digest UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `events`: append-only, listed per task in logging order.
async fn init_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS events SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_event_id ON TABLE events COLUMNS event_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_event_task ON TABLE events COLUMNS task_id, created_at;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
