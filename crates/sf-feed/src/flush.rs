//! Transactional merge of buffered interactions into Postgres.
//!
//! Every flush runs in one transaction: stage the batch in a temp table that
//! is dropped on commit, merge it into the junction table, then bring the
//! denormalized counters of the touched posts up to date. Any failure rolls
//! the whole batch back.

use crate::buffer::{FlushReport, FlushSink};
use crate::error::{db_id, FeedError, Result};
use crate::pending::{
    EventKind, PendingBatch, PendingDislike, PendingLike, PendingView, ReplyBatch,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, QueryBuilder, Transaction};
use std::collections::BTreeMap;

/// Rows per staging INSERT. Three binds per row keeps each statement far below
/// the Postgres limit of 65535 bind parameters.
const STAGING_CHUNK_ROWS: usize = 1000;

/// Junction table and the counter column it feeds.
#[derive(Debug, Clone, Copy)]
struct Junction {
    table: &'static str,
    staging: &'static str,
    counter: &'static str,
}

const LIKES: Junction = Junction {
    table: "likes",
    staging: "tmp_likes",
    counter: "likes_count",
};

const VIEWS: Junction = Junction {
    table: "views",
    staging: "tmp_views",
    counter: "views_count",
};

struct StagedRow {
    post_id: i64,
    user_id: i64,
    created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgFlushPipeline {
    pool: Pool<Postgres>,
}

impl PgFlushPipeline {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn flush_likes(&self, likes: &[PendingLike]) -> Result<FlushReport> {
        let rows = likes
            .iter()
            .map(|like| staged(like.post_id, like.user_id, like.created_at))
            .collect::<Result<Vec<_>>>()?;
        self.merge_interactions(EventKind::Like, LIKES, &rows).await
    }

    pub async fn flush_views(&self, views: &[PendingView]) -> Result<FlushReport> {
        let rows = views
            .iter()
            .map(|view| staged(view.post_id, view.user_id, view.created_at))
            .collect::<Result<Vec<_>>>()?;
        self.merge_interactions(EventKind::View, VIEWS, &rows).await
    }

    pub async fn flush_dislikes(&self, dislikes: &[PendingDislike]) -> Result<FlushReport> {
        let pairs = dislikes
            .iter()
            .map(|dislike| Ok((db_id(dislike.post_id)?, db_id(dislike.user_id)?)))
            .collect::<Result<Vec<_>>>()?;
        if pairs.is_empty() {
            return Ok(empty_report(EventKind::Dislike));
        }

        let mut tx = self.begin(EventKind::Dislike).await?;
        let (deleted, posts_touched) = remove_likes(&mut tx, &pairs)
            .await
            .map_err(|source| transaction_error(EventKind::Dislike, source))?;
        self.commit(EventKind::Dislike, tx).await?;

        Ok(FlushReport {
            kind: EventKind::Dislike,
            events: dislikes.len(),
            applied: deleted,
            posts_touched,
        })
    }

    pub async fn flush_replies(&self, replies: &ReplyBatch) -> Result<FlushReport> {
        let increments = replies
            .sorted_increments()
            .into_iter()
            .map(|(parent_id, count)| {
                Ok((db_id(parent_id)?, i64::try_from(count).unwrap_or(i64::MAX)))
            })
            .collect::<Result<Vec<_>>>()?;
        if increments.is_empty() {
            return Ok(empty_report(EventKind::ReplyIncrement));
        }

        let mut tx = self.begin(EventKind::ReplyIncrement).await?;
        let mut posts_touched = 0u64;
        for (parent_id, count) in &increments {
            let result = sqlx::query(
                "UPDATE posts SET replies_count = replies_count + $1 WHERE id = $2",
            )
            .bind(count)
            .bind(parent_id)
            .execute(&mut *tx)
            .await
            .map_err(|source| transaction_error(EventKind::ReplyIncrement, source))?;
            posts_touched += result.rows_affected();
        }
        self.commit(EventKind::ReplyIncrement, tx).await?;

        Ok(FlushReport {
            kind: EventKind::ReplyIncrement,
            events: replies.len(),
            applied: increments.iter().map(|(_, count)| *count as u64).sum(),
            posts_touched,
        })
    }

    async fn merge_interactions(
        &self,
        kind: EventKind,
        junction: Junction,
        rows: &[StagedRow],
    ) -> Result<FlushReport> {
        if rows.is_empty() {
            return Ok(empty_report(kind));
        }

        let mut tx = self.begin(kind).await?;
        let (inserted, posts_touched) = merge_staged(&mut tx, junction, rows)
            .await
            .map_err(|source| transaction_error(kind, source))?;
        self.commit(kind, tx).await?;

        Ok(FlushReport {
            kind,
            events: rows.len(),
            applied: inserted,
            posts_touched,
        })
    }

    async fn begin(&self, kind: EventKind) -> Result<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|source| transaction_error(kind, source))
    }

    async fn commit(&self, kind: EventKind, tx: Transaction<'static, Postgres>) -> Result<()> {
        tx.commit()
            .await
            .map_err(|source| transaction_error(kind, source))
    }
}

fn staged(post_id: u64, user_id: u64, created_at: DateTime<Utc>) -> Result<StagedRow> {
    Ok(StagedRow {
        post_id: db_id(post_id)?,
        user_id: db_id(user_id)?,
        created_at,
    })
}

fn empty_report(kind: EventKind) -> FlushReport {
    FlushReport {
        kind,
        events: 0,
        applied: 0,
        posts_touched: 0,
    }
}

fn transaction_error(kind: EventKind, source: sqlx::Error) -> FeedError {
    FeedError::Transaction { kind, source }
}

/// Row-locks the posts referenced by `staging` in ascending id order, before
/// any junction or counter write. Reply flushes update parents in the same
/// order, so concurrent flushes over overlapping posts cannot deadlock.
async fn lock_posts(
    tx: &mut Transaction<'static, Postgres>,
    staging: &str,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "SELECT id FROM posts WHERE id IN (SELECT DISTINCT post_id FROM {staging}) \
         ORDER BY id FOR NO KEY UPDATE"
    ))
    .fetch_all(&mut **tx)
    .await?;
    Ok(())
}

/// Returns (junction rows inserted, posts whose counter was recomputed).
async fn merge_staged(
    tx: &mut Transaction<'static, Postgres>,
    junction: Junction,
    rows: &[StagedRow],
) -> std::result::Result<(u64, u64), sqlx::Error> {
    sqlx::query(&format!(
        "CREATE TEMP TABLE {} (post_id BIGINT NOT NULL, user_id BIGINT NOT NULL, created_at TIMESTAMPTZ NOT NULL) ON COMMIT DROP",
        junction.staging
    ))
    .execute(&mut **tx)
    .await?;

    for chunk in rows.chunks(STAGING_CHUNK_ROWS) {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} (post_id, user_id, created_at) ",
            junction.staging
        ));
        builder.push_values(chunk, |mut row, staged| {
            row.push_bind(staged.post_id)
                .push_bind(staged.user_id)
                .push_bind(staged.created_at);
        });
        builder.build().execute(&mut **tx).await?;
    }

    lock_posts(tx, junction.staging).await?;

    // Duplicate pairs inside the batch collapse to their earliest timestamp;
    // pairs already stored are skipped. Rows for unknown or deleted posts and
    // unknown users are dropped instead of failing the batch.
    let inserted = sqlx::query(&format!(
        "INSERT INTO {table} (post_id, user_id, created_at) \
         SELECT s.post_id, s.user_id, MIN(s.created_at) \
         FROM {staging} s \
         JOIN posts p ON p.id = s.post_id AND p.deleted_at IS NULL \
         JOIN users u ON u.id = s.user_id \
         GROUP BY s.post_id, s.user_id \
         ON CONFLICT (user_id, post_id) DO NOTHING",
        table = junction.table,
        staging = junction.staging
    ))
    .execute(&mut **tx)
    .await?
    .rows_affected();

    let posts_touched = sqlx::query(&format!(
        "UPDATE posts SET {counter} = (SELECT COUNT(*) FROM {table} j WHERE j.post_id = posts.id) \
         WHERE posts.id IN (SELECT DISTINCT post_id FROM {staging})",
        counter = junction.counter,
        table = junction.table,
        staging = junction.staging
    ))
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok((inserted, posts_touched))
}

/// Returns (like rows deleted, posts whose counter was decremented).
async fn remove_likes(
    tx: &mut Transaction<'static, Postgres>,
    pairs: &[(i64, i64)],
) -> std::result::Result<(u64, u64), sqlx::Error> {
    sqlx::query(
        "CREATE TEMP TABLE tmp_dislikes (post_id BIGINT NOT NULL, user_id BIGINT NOT NULL) ON COMMIT DROP",
    )
    .execute(&mut **tx)
    .await?;

    for chunk in pairs.chunks(STAGING_CHUNK_ROWS) {
        let mut builder =
            QueryBuilder::<Postgres>::new("INSERT INTO tmp_dislikes (post_id, user_id) ");
        builder.push_values(chunk, |mut row, (post_id, user_id)| {
            row.push_bind(*post_id).push_bind(*user_id);
        });
        builder.build().execute(&mut **tx).await?;
    }

    lock_posts(tx, "tmp_dislikes").await?;

    let deleted_posts = sqlx::query_scalar::<_, i64>(
        "DELETE FROM likes l \
         USING (SELECT DISTINCT post_id, user_id FROM tmp_dislikes) d \
         WHERE l.post_id = d.post_id AND l.user_id = d.user_id \
         RETURNING l.post_id",
    )
    .fetch_all(&mut **tx)
    .await?;

    if deleted_posts.is_empty() {
        return Ok((0, 0));
    }

    let mut per_post: BTreeMap<i64, i64> = BTreeMap::new();
    for post_id in &deleted_posts {
        *per_post.entry(*post_id).or_insert(0) += 1;
    }
    let (post_ids, removed): (Vec<i64>, Vec<i64>) = per_post.into_iter().unzip();

    let posts_touched = sqlx::query(
        "UPDATE posts SET likes_count = posts.likes_count - d.removed \
         FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS d(post_id, removed) \
         WHERE posts.id = d.post_id",
    )
    .bind(post_ids)
    .bind(removed)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok((deleted_posts.len() as u64, posts_touched))
}

#[async_trait]
impl FlushSink<Vec<PendingLike>> for PgFlushPipeline {
    async fn flush(&self, batch: Vec<PendingLike>) -> Result<FlushReport> {
        self.flush_likes(&batch).await
    }
}

#[async_trait]
impl FlushSink<Vec<PendingDislike>> for PgFlushPipeline {
    async fn flush(&self, batch: Vec<PendingDislike>) -> Result<FlushReport> {
        self.flush_dislikes(&batch).await
    }
}

#[async_trait]
impl FlushSink<Vec<PendingView>> for PgFlushPipeline {
    async fn flush(&self, batch: Vec<PendingView>) -> Result<FlushReport> {
        self.flush_views(&batch).await
    }
}

#[async_trait]
impl FlushSink<ReplyBatch> for PgFlushPipeline {
    async fn flush(&self, batch: ReplyBatch) -> Result<FlushReport> {
        self.flush_replies(&batch).await
    }
}
