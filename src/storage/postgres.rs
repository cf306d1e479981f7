use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use super::{build_timer, Storage};
use crate::db;
use crate::execution::Execution;
use crate::hooker::Trap;
use crate::ids;
use crate::types::{Message, Timer, Trace};

/// Postgres storage
///
/// Every record is kept whole in a JSONB `content` column; the other
/// columns only serve lookups and ordering.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn content<T: DeserializeOwned>(row: &sqlx::postgres::PgRow) -> Result<T> {
    let value: JsonValue = row.get("content");
    serde_json::from_value(value).context("Failed to decode stored content")
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue> {
    serde_json::to_value(value).context("Failed to encode content")
}

#[async_trait]
impl Storage for PgStorage {
    fn identity(&self) -> String {
        format!("postgres(size={})", self.pool.size())
    }

    async fn put_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cadence_messages (exid, point, content)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&message.exid)
        .bind(message.point.as_str())
        .bind(to_json(message)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        Ok(())
    }

    async fn fetch_messages(&self, exid: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            UPDATE cadence_messages
            SET status = 'loaded'
            WHERE id IN (
                SELECT id FROM cadence_messages
                WHERE exid = $1
                  AND status = 'created'
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, content
            "#,
        )
        .bind(exid)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        let mut messages = Vec::new();
        for row in rows {
            let id: i64 = row.get("id");
            messages.push((id, content::<Message>(&row)?));
        }
        messages.sort_by_key(|(id, _)| *id);

        Ok(messages.into_iter().map(|(_, m)| m).collect())
    }

    async fn consume_messages(&self, exid: &str) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM cadence_messages
            WHERE exid = $1
              AND status = 'loaded'
            "#,
        )
        .bind(exid)
        .execute(&self.pool)
        .await
        .context("Failed to consume messages")?;

        Ok(())
    }

    async fn release_messages(&self, exid: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cadence_messages
            SET status = 'created'
            WHERE exid = $1
              AND status = 'loaded'
            "#,
        )
        .bind(exid)
        .execute(&self.pool)
        .await
        .context("Failed to release messages")?;

        Ok(())
    }

    async fn load_exids(&self) -> Result<Vec<String>> {
        let exids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT exid FROM cadence_messages
            WHERE status = 'created'
            GROUP BY exid
            ORDER BY MIN(id) ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load exids")?;

        Ok(exids)
    }

    async fn load_timers(&self) -> Result<Vec<Timer>> {
        let rows = sqlx::query(
            r#"
            SELECT content FROM cadence_timers
            ORDER BY ntime ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load timers")?;

        rows.iter().map(content).collect()
    }

    async fn put_timer(&self, message: &Message) -> Result<Timer> {
        let timer = build_timer(message)?;

        sqlx::query(
            r#"
            INSERT INTO cadence_timers (id, exid, nid, ntime, count, content)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(timer.id)
        .bind(&timer.exid)
        .bind(&timer.nid)
        .bind(timer.ntime)
        .bind(timer.count as i32)
        .bind(to_json(&timer)?)
        .execute(&self.pool)
        .await
        .context("Failed to insert timer")?;

        Ok(timer)
    }

    async fn trigger_timer(&self, timer: &Timer) -> Result<Option<Timer>> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let exists = sqlx::query("SELECT id FROM cadence_timers WHERE id = $1 FOR UPDATE")
            .bind(timer.id)
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to lock timer")?
            .is_some();
        if !exists {
            return Ok(None);
        }

        sqlx::query(
            r#"
            INSERT INTO cadence_messages (exid, point, content)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&timer.message.exid)
        .bind(timer.message.point.as_str())
        .bind(to_json(&timer.message)?)
        .execute(&mut *tx)
        .await
        .context("Failed to queue timer message")?;

        let next = if timer.schedule.is_recurring() {
            let mut next = timer.clone();
            next.count += 1;
            next.ntime = timer
                .schedule
                .next_time(Utc::now())
                .with_context(|| format!("cannot read schedule {:?}", timer.schedule))?;

            sqlx::query(
                r#"
                UPDATE cadence_timers
                SET ntime = $2, count = $3, content = $4
                WHERE id = $1
                "#,
            )
            .bind(next.id)
            .bind(next.ntime)
            .bind(next.count as i32)
            .bind(to_json(&next)?)
            .execute(&mut *tx)
            .await
            .context("Failed to reschedule timer")?;

            Some(next)
        } else {
            sqlx::query("DELETE FROM cadence_timers WHERE id = $1")
                .bind(timer.id)
                .execute(&mut *tx)
                .await
                .context("Failed to delete timer")?;
            None
        };

        tx.commit().await.context("Failed to commit timer trigger")?;

        Ok(next)
    }

    async fn remove_timers(&self, exid: &str, nid: &str) -> Result<()> {
        sqlx::query("DELETE FROM cadence_timers WHERE exid = $1 AND nid = $2")
            .bind(exid)
            .bind(nid)
            .execute(&self.pool)
            .await
            .context("Failed to remove timers")?;

        Ok(())
    }

    async fn put_trap(&self, nid: &str, trap: &Trap) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cadence_traps (id, exid, nid, bnid, texid, content)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id)
            DO UPDATE SET content = $6
            "#,
        )
        .bind(trap.id)
        .bind(&trap.exid)
        .bind(nid)
        .bind(&trap.bnid)
        .bind(&trap.opts.exid)
        .bind(to_json(trap)?)
        .execute(&self.pool)
        .await
        .context("Failed to save trap")?;

        Ok(())
    }

    async fn load_traps(&self, exid: &str) -> Result<Vec<Trap>> {
        let rows = sqlx::query(
            r#"
            SELECT content FROM cadence_traps
            WHERE exid = $1 OR texid IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(exid)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load traps")?;

        rows.iter().map(content).collect()
    }

    async fn remove_traps(&self, exid: &str, bnid: &str) -> Result<()> {
        sqlx::query("DELETE FROM cadence_traps WHERE exid = $1 AND bnid = $2")
            .bind(exid)
            .bind(bnid)
            .execute(&self.pool)
            .await
            .context("Failed to remove traps")?;

        Ok(())
    }

    async fn remove_trap(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM cadence_traps WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to remove trap")?;

        Ok(())
    }

    async fn load_execution(&self, exid: &str) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT content FROM cadence_executions WHERE exid = $1")
            .bind(exid)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load execution")?;

        row.as_ref().map(content).transpose()
    }

    async fn put_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cadence_executions (exid, domain, status, content, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (exid)
            DO UPDATE SET
                status = $3,
                content = $4,
                updated_at = $6
            "#,
        )
        .bind(&execution.exid)
        .bind(ids::exid_domain(&execution.exid).unwrap_or_default())
        .bind(execution.status)
        .bind(to_json(execution)?)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to save execution")?;

        Ok(())
    }

    async fn put_trace(&self, trace: &Trace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cadence_traces (exid, nid, text, tstamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&trace.exid)
        .bind(&trace.nid)
        .bind(&trace.text)
        .bind(trace.tstamp)
        .execute(&self.pool)
        .await
        .context("Failed to save trace")?;

        Ok(())
    }

    async fn load_traces(&self, exid: &str) -> Result<Vec<Trace>> {
        let rows = sqlx::query(
            r#"
            SELECT exid, nid, text, tstamp FROM cadence_traces
            WHERE exid = $1
            ORDER BY id ASC
            "#,
        )
        .bind(exid)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load traces")?;

        let mut traces = Vec::new();
        for row in rows {
            traces.push(Trace {
                exid: row.get("exid"),
                nid: row.get("nid"),
                text: row.get("text"),
                tstamp: row.get("tstamp"),
            });
        }

        Ok(traces)
    }

    async fn db_version(&self) -> Result<Option<i64>> {
        let migrated: bool = sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations') IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .context("Failed to look for the migrations table")?;
        if !migrated {
            return Ok(None);
        }

        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
            .fetch_one(&self.pool)
            .await
            .context("Failed to read schema version")?;

        Ok(version)
    }

    fn migration_version(&self) -> Option<i64> {
        db::migration_version()
    }

    async fn migrate(&self) -> Result<()> {
        db::migrate(&self.pool).await
    }

    async fn shutdown(&self) {
        self.pool.close().await;
    }
}
