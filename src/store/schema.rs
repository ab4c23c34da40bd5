//! Analytics mirror schema and idempotent migration runner.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, and applied
//! migrations are recorded in `_migrations`, so the runner is safe to
//! execute on every startup.

use sqlx::PgPool;
use tracing::{debug, info};

use super::analytics::AnalyticsError;

/// Ordered list of migrations. Append only; never edit an entry that
/// has shipped.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_runs",
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            status TEXT NOT NULL,
            review_required BOOLEAN NOT NULL DEFAULT FALSE,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "002_run_steps",
        r#"
        CREATE TABLE IF NOT EXISTS run_steps (
            id BIGSERIAL PRIMARY KEY,
            run_id UUID NOT NULL,
            stage TEXT NOT NULL,
            iteration INT NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'RUNNING',
            summary TEXT,
            started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            finished_at TIMESTAMPTZ
        )
        "#,
    ),
    (
        "003_generation_calls",
        r#"
        CREATE TABLE IF NOT EXISTS generation_calls (
            id BIGSERIAL PRIMARY KEY,
            run_id UUID NOT NULL,
            stage TEXT NOT NULL,
            model TEXT NOT NULL,
            prompt_tokens INT NOT NULL DEFAULT 0,
            completion_tokens INT NOT NULL DEFAULT 0,
            latency_ms BIGINT NOT NULL DEFAULT 0,
            success BOOLEAN NOT NULL,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "004_run_rubrics",
        r#"
        CREATE TABLE IF NOT EXISTS run_rubrics (
            run_id UUID NOT NULL,
            attempt INT NOT NULL,
            clarity DOUBLE PRECISION NOT NULL,
            correctness DOUBLE PRECISION NOT NULL,
            completeness DOUBLE PRECISION NOT NULL,
            overall DOUBLE PRECISION NOT NULL,
            passed BOOLEAN NOT NULL,
            grader_model TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (run_id, attempt)
        )
        "#,
    ),
    (
        "005_run_logs",
        r#"
        CREATE TABLE IF NOT EXISTS run_logs (
            id BIGSERIAL PRIMARY KEY,
            run_id UUID NOT NULL,
            message TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "006_indexes",
        r#"
        CREATE INDEX IF NOT EXISTS idx_run_steps_run_id ON run_steps (run_id);
        CREATE INDEX IF NOT EXISTS idx_generation_calls_run_id ON generation_calls (run_id);
        CREATE INDEX IF NOT EXISTS idx_run_logs_run_id ON run_logs (run_id)
        "#,
    ),
];

/// Apply all pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AnalyticsError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    let mut applied = 0usize;
    for (name, sql) in MIGRATIONS {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT name FROM _migrations WHERE name = $1")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if exists.is_some() {
            debug!(migration = name, "already applied");
            continue;
        }

        for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(pool).await?;
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(pool)
            .await?;
        applied += 1;
    }

    if applied > 0 {
        info!(applied, "analytics migrations applied");
    }
    Ok(())
}
