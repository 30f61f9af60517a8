use std::collections::HashMap;

use shared::models::{Poll, PollOption};
use sqlx::{postgres::PgRow, PgPool, Row};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::store::{DurableStore, StoreError, StoreResult, SyncOutcome};

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Postgres-backed [`DurableStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn options_for(&self, poll_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, Vec<PollOption>>> {
        let rows = sqlx::query(
            "SELECT id, poll_id, text, votes FROM poll_options
             WHERE poll_id = ANY($1)
             ORDER BY poll_id, position",
        )
        .bind(poll_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_poll: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
        for row in rows {
            let option = option_from_row(&row)?;
            by_poll.entry(option.poll_id).or_default().push(option);
        }
        Ok(by_poll)
    }
}

fn option_from_row(row: &PgRow) -> StoreResult<PollOption> {
    Ok(PollOption {
        id: row.try_get("id")?,
        poll_id: row.try_get("poll_id")?,
        text: row.try_get("text")?,
        votes: row.try_get("votes")?,
    })
}

fn poll_from_row(row: &PgRow, options: Vec<PollOption>) -> StoreResult<Poll> {
    Ok(Poll {
        id: row.try_get("id")?,
        question: row.try_get("question")?,
        options,
        created_at: row.try_get("created_at")?,
    })
}

#[rocket::async_trait]
impl DurableStore for PgStore {
    async fn find_option(&self, option_id: Uuid) -> StoreResult<Option<PollOption>> {
        let row = sqlx::query("SELECT id, poll_id, text, votes FROM poll_options WHERE id = $1")
            .bind(option_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(option_from_row).transpose()
    }

    async fn find_poll(&self, poll_id: Uuid) -> StoreResult<Option<Poll>> {
        let row = sqlx::query("SELECT id, question, created_at FROM polls WHERE id = $1")
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let mut options = self.options_for(&[poll_id]).await?;
        poll_from_row(&row, options.remove(&poll_id).unwrap_or_default()).map(Some)
    }

    async fn list_polls(&self) -> StoreResult<Vec<Poll>> {
        let rows = sqlx::query("SELECT id, question, created_at FROM polls ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut options = self.options_for(&ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| poll_from_row(row, options.remove(&id).unwrap_or_default()))
            .collect()
    }

    async fn apply_sync(&self, option_id: Uuid, amount: i64, token: Uuid) -> StoreResult<SyncOutcome> {
        let mut tx = self.pool.begin().await?;

        let recorded = sqlx::query(
            "INSERT INTO vote_syncs (token, option_id, amount) VALUES ($1, $2, $3)
             ON CONFLICT (token) DO NOTHING",
        )
        .bind(token)
        .bind(option_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if recorded.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("Sync token {} for option {} already applied", token, option_id);
            return Ok(SyncOutcome::AlreadyApplied);
        }

        let updated = sqlx::query("UPDATE poll_options SET votes = votes + $2 WHERE id = $1")
            .bind(option_id)
            .bind(amount)
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound);
        }

        tx.commit().await?;
        Ok(SyncOutcome::Applied)
    }

    async fn prune_sync_ledger(&self, older_than: time::Duration, keep: &[Uuid]) -> StoreResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let result = sqlx::query("DELETE FROM vote_syncs WHERE applied_at < $1 AND NOT (token = ANY($2))")
            .bind(cutoff)
            .bind(keep)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sum_all_votes(&self) -> StoreResult<i64> {
        let total: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(votes), 0)::BIGINT FROM poll_options")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    async fn create_poll(&self, poll: &Poll) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO polls (id, question, created_at) VALUES ($1, $2, $3)")
            .bind(poll.id)
            .bind(&poll.question)
            .bind(poll.created_at)
            .execute(&mut *tx)
            .await?;

        for (position, option) in poll.options.iter().enumerate() {
            sqlx::query(
                "INSERT INTO poll_options (id, poll_id, text, position, votes)
                 VALUES ($1, $2, $3, $4, 0)",
            )
            .bind(option.id)
            .bind(poll.id)
            .bind(&option.text)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_option(&self, option_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM poll_options WHERE id = $1")
            .bind(option_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_poll(&self, poll_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
