use super::model::{NewStepEvent, OutboxMessage, RunRow, StepEvent};
use crate::model::{RunState, StepOutcome};
use crate::retry::redelivery_backoff_secs;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

/// Fixed-width UTC timestamp; compares correctly as text.
pub fn ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let in_memory = normalized.contains(":memory:");
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new()
        // Each in-memory connection would otherwise see its own database.
        .max_connections(if in_memory { 1 } else { 5 })
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- queue ----

#[instrument(skip(pool, payload))]
pub async fn enqueue_outbox(
    pool: &Pool,
    topic: &str,
    ordering_key: Option<&str>,
    payload: &Value,
    due_at: DateTime<Utc>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO outbox (id, topic, ordering_key, payload, attempt, due_at, created_at) VALUES (?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(&id)
    .bind(topic)
    .bind(ordering_key)
    .bind(payload.to_string())
    .bind(ts(due_at))
    .bind(ts(Utc::now()))
    .execute(pool)
    .await
    .context("failed to enqueue message")?;
    Ok(id)
}

/// Lease the oldest due message on `topic`. Messages whose ordering key is
/// already leased by another delivery are skipped so one record is never
/// processed by two workers at once.
#[instrument(skip(pool))]
pub async fn claim_next_outbox(
    pool: &Pool,
    topic: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Option<OutboxMessage>> {
    let now_s = ts(now);
    let candidate = sqlx::query_as::<_, OutboxMessage>(
        "SELECT o.id, o.topic, o.ordering_key, o.payload, o.attempt FROM outbox o \
         WHERE o.topic = ? AND o.dead_lettered = 0 AND o.due_at <= ? \
           AND (o.leased_until IS NULL OR o.leased_until <= ?) \
           AND NOT EXISTS ( \
             SELECT 1 FROM outbox p \
             WHERE o.ordering_key IS NOT NULL AND p.ordering_key = o.ordering_key \
               AND p.id <> o.id AND p.dead_lettered = 0 \
               AND p.leased_until IS NOT NULL AND p.leased_until > ?) \
         ORDER BY o.created_at ASC, o.rowid ASC LIMIT 1",
    )
    .bind(topic)
    .bind(&now_s)
    .bind(&now_s)
    .bind(&now_s)
    .fetch_optional(pool)
    .await?;

    let Some(msg) = candidate else {
        return Ok(None);
    };

    // Conditional update: another worker may have leased it in between.
    let leased = sqlx::query(
        "UPDATE outbox SET leased_until = ? WHERE id = ? AND (leased_until IS NULL OR leased_until <= ?)",
    )
    .bind(ts(now + lease))
    .bind(&msg.id)
    .bind(&now_s)
    .execute(pool)
    .await?
    .rows_affected();

    Ok((leased == 1).then_some(msg))
}

/// Push the lease of an in-flight delivery out to `leased_until`. Returns
/// false when the message is no longer leased.
#[instrument(skip(pool))]
pub async fn renew_outbox_lease(pool: &Pool, id: &str, leased_until: DateTime<Utc>) -> Result<bool> {
    let renewed = sqlx::query(
        "UPDATE outbox SET leased_until = ? WHERE id = ? AND dead_lettered = 0 AND leased_until IS NOT NULL",
    )
    .bind(ts(leased_until))
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(renewed == 1)
}

#[instrument(skip(pool))]
pub async fn delete_outbox(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Release the lease and reschedule with exponential backoff.
#[instrument(skip(pool, error))]
pub async fn backoff_outbox(
    pool: &Pool,
    id: &str,
    attempt: i64,
    max_cap_secs: i64,
    error: &str,
) -> Result<i64> {
    let secs = redelivery_backoff_secs(attempt as i32, max_cap_secs);
    sqlx::query(
        "UPDATE outbox SET attempt = ?, due_at = ?, leased_until = NULL, last_error = ? WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(ts(Utc::now() + Duration::seconds(secs)))
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(secs)
}

#[instrument(skip(pool, error))]
pub async fn dead_letter_outbox(pool: &Pool, id: &str, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE outbox SET dead_lettered = 1, leased_until = NULL, attempt = attempt + 1, last_error = ? WHERE id = ?",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip(pool))]
pub async fn count_pending_outbox(pool: &Pool, topic: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE topic = ? AND dead_lettered = 0")
            .bind(topic)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[instrument(skip(pool))]
pub async fn count_pending_for_key(pool: &Pool, topic: &str, ordering_key: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox WHERE topic = ? AND ordering_key = ? AND dead_lettered = 0",
    )
    .bind(topic)
    .bind(ordering_key)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Dead letters sharing `ordering_key`, as `(id, attempt, last_error)`.
pub async fn list_dead_letters_for_key(
    pool: &Pool,
    topic: &str,
    ordering_key: &str,
) -> Result<Vec<(String, i64, Option<String>)>> {
    let rows = sqlx::query_as(
        "SELECT id, attempt, last_error FROM outbox \
         WHERE topic = ? AND ordering_key = ? AND dead_lettered = 1 ORDER BY created_at ASC",
    )
    .bind(topic)
    .bind(ordering_key)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// `(id, attempt, last_error)` of dead-lettered messages, oldest first.
pub async fn list_dead_letters(pool: &Pool, topic: &str) -> Result<Vec<(String, i64, Option<String>)>> {
    let rows = sqlx::query_as(
        "SELECT id, attempt, last_error FROM outbox WHERE topic = ? AND dead_lettered = 1 ORDER BY created_at ASC",
    )
    .bind(topic)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ---- runs ----

#[instrument(skip(pool))]
pub async fn create_run(pool: &Pool, record_id: u32, actor: &str, start_step: &str) -> Result<String> {
    let run_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO pipeline_runs (run_id, record_id, actor, start_step, state, started_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&run_id)
    .bind(record_id as i64)
    .bind(actor)
    .bind(start_step)
    .bind(RunState::Running.as_str())
    .bind(ts(Utc::now()))
    .execute(pool)
    .await
    .context("failed to record pipeline run")?;
    Ok(run_id)
}

#[instrument(skip(pool, error))]
pub async fn finish_run(
    pool: &Pool,
    run_id: &str,
    state: RunState,
    failed_step: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE pipeline_runs SET state = ?, failed_step = ?, error = ?, finished_at = ? WHERE run_id = ?",
    )
    .bind(state.as_str())
    .bind(failed_step)
    .bind(error)
    .bind(ts(Utc::now()))
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to finish pipeline run")?;
    Ok(())
}

pub async fn latest_run(pool: &Pool, record_id: u32) -> Result<Option<RunRow>> {
    let row = sqlx::query_as::<_, RunRow>(
        "SELECT run_id, record_id, actor, start_step, state, failed_step, error, started_at, finished_at \
         FROM pipeline_runs WHERE record_id = ? ORDER BY started_at DESC, rowid DESC LIMIT 1",
    )
    .bind(record_id as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ---- step history ----

pub async fn append_step_event(pool: &Pool, ev: &NewStepEvent<'_>) -> Result<()> {
    sqlx::query(
        "INSERT INTO step_history (run_id, record_id, step, outcome, actor, detail, fingerprint, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(ev.run_id)
    .bind(ev.record_id as i64)
    .bind(ev.step)
    .bind(ev.outcome)
    .bind(ev.actor)
    .bind(ev.detail)
    .bind(ev.fingerprint)
    .bind(ts(Utc::now()))
    .execute(pool)
    .await
    .context("failed to append step history")?;
    Ok(())
}

/// Step log for a record, optionally limited to one run, in insertion order.
pub async fn list_step_history(
    pool: &Pool,
    record_id: u32,
    run_id: Option<&str>,
) -> Result<Vec<StepEvent>> {
    let rows = sqlx::query_as::<_, StepEvent>(
        "SELECT run_id, record_id, step, outcome, actor, detail, fingerprint, created_at \
         FROM step_history WHERE record_id = ? AND (? IS NULL OR run_id = ?) ORDER BY id ASC",
    )
    .bind(record_id as i64)
    .bind(run_id)
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Whether `step` already succeeded for this record with the same fingerprint
/// in any earlier run.
pub async fn step_succeeded_with(
    pool: &Pool,
    record_id: u32,
    step: &str,
    fingerprint: &str,
) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM step_history WHERE record_id = ? AND step = ? AND outcome = ? AND fingerprint = ? LIMIT 1",
    )
    .bind(record_id as i64)
    .bind(step)
    .bind(StepOutcome::Succeeded.as_str())
    .bind(fingerprint)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = ts(Utc::now());
        let b = ts(Utc::now() + Duration::milliseconds(5));
        assert!(a < b);
        assert_eq!(a.len(), "2025-01-01 00:00:00.000".len());
    }

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[tokio::test]
    async fn claim_ack_and_backoff_flow() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let id = enqueue_outbox(&pool, "t", Some("42"), &json!({"id": 42}), now)
            .await
            .unwrap();

        let msg = claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.attempt, 0);

        // Leased: not visible to a second claimer.
        assert!(claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .is_none());

        let delay = backoff_outbox(&pool, &id, msg.attempt, 60, "boom").await.unwrap();
        assert_eq!(delay, 5);
        assert!(claim_next_outbox(&pool, "t", Utc::now(), Duration::seconds(30))
            .await
            .unwrap()
            .is_none());

        let later = Utc::now() + Duration::seconds(6);
        let again = claim_next_outbox(&pool, "t", later, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempt, 1);

        delete_outbox(&pool, &id).await.unwrap();
        assert_eq!(count_pending_outbox(&pool, "t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn same_key_is_serialized() {
        let pool = setup_pool().await;
        let now = Utc::now();
        enqueue_outbox(&pool, "t", Some("7"), &json!({"n": 1}), now).await.unwrap();
        enqueue_outbox(&pool, "t", Some("7"), &json!({"n": 2}), now).await.unwrap();
        enqueue_outbox(&pool, "t", Some("8"), &json!({"n": 3}), now).await.unwrap();

        let first = claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.ordering_key.as_deref(), Some("7"));
        let second = claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.ordering_key.as_deref(), Some("8"));
        assert!(claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dead_letters_are_kept_but_not_claimed() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let id = enqueue_outbox(&pool, "t", None, &json!({}), now).await.unwrap();
        dead_letter_outbox(&pool, &id, "bad content URL").await.unwrap();
        assert!(claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .is_none());
        let dead = list_dead_letters(&pool, "t").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].2.as_deref(), Some("bad content URL"));
    }

    #[tokio::test]
    async fn renewed_lease_holds_past_original_expiry() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let id = enqueue_outbox(&pool, "t", Some("42"), &json!({}), now).await.unwrap();
        claim_next_outbox(&pool, "t", now, Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();

        assert!(renew_outbox_lease(&pool, &id, now + Duration::seconds(120)).await.unwrap());
        let after_first_lease = now + Duration::seconds(60);
        assert!(claim_next_outbox(&pool, "t", after_first_lease, Duration::seconds(30))
            .await
            .unwrap()
            .is_none());

        delete_outbox(&pool, &id).await.unwrap();
        assert!(!renew_outbox_lease(&pool, &id, now + Duration::seconds(240)).await.unwrap());
    }

    #[tokio::test]
    async fn per_key_counts_ignore_other_records() {
        let pool = setup_pool().await;
        let now = Utc::now();
        enqueue_outbox(&pool, "t", Some("42"), &json!({}), now).await.unwrap();
        enqueue_outbox(&pool, "t", Some("7"), &json!({}), now).await.unwrap();
        let dead = enqueue_outbox(&pool, "t", Some("42"), &json!({}), now).await.unwrap();
        dead_letter_outbox(&pool, &dead, "record 42 not found").await.unwrap();

        assert_eq!(count_pending_outbox(&pool, "t").await.unwrap(), 2);
        assert_eq!(count_pending_for_key(&pool, "t", "42").await.unwrap(), 1);
        assert_eq!(count_pending_for_key(&pool, "t", "9").await.unwrap(), 0);
        let letters = list_dead_letters_for_key(&pool, "t", "42").await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].0, dead);
        assert!(list_dead_letters_for_key(&pool, "t", "7").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn runs_and_history_round_trip() {
        let pool = setup_pool().await;
        let run = create_run(&pool, 42, "queue", "SET_VALUE").await.unwrap();
        append_step_event(
            &pool,
            &NewStepEvent {
                run_id: &run,
                record_id: 42,
                step: "NOTIFY_CUSTOMER",
                outcome: "succeeded",
                actor: "queue",
                detail: None,
                fingerprint: Some("1200"),
            },
        )
        .await
        .unwrap();
        finish_run(&pool, &run, RunState::Succeeded, None, None).await.unwrap();

        let latest = latest_run(&pool, 42).await.unwrap().unwrap();
        assert_eq!(latest.run_id, run);
        assert_eq!(latest.state, "succeeded");
        assert!(step_succeeded_with(&pool, 42, "NOTIFY_CUSTOMER", "1200").await.unwrap());
        assert!(!step_succeeded_with(&pool, 42, "NOTIFY_CUSTOMER", "1300").await.unwrap());
        assert_eq!(list_step_history(&pool, 42, Some(run.as_str())).await.unwrap().len(), 1);
        assert!(list_step_history(&pool, 42, Some("other")).await.unwrap().is_empty());
    }
}
