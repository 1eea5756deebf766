use crate::buffer::{BatchBuffer, FlushReport, FlushSink};
use crate::config::FeedRuntimeConfig;
use crate::error::{api_id, db_id, FeedError, Result};
use crate::feed::{FeedAggregator, PgFeedSource};
use crate::flush::PgFlushPipeline;
use crate::model::{NewPost, Post, PostFilter, PostView};
use crate::pending::{
    PendingDislike, PendingLike, PendingView, PostId, ReplyBatch, ReplyIncrement, UserId,
};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Pool, Postgres, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn create_post(&self, post: NewPost) -> Result<Post>;
    async fn get_all_posts(&self, filter: PostFilter) -> Result<Vec<PostView>>;
    async fn get_post_by_id(&self, post_id: PostId, user_id: UserId) -> Result<PostView>;
    async fn delete_post(&self, post_id: PostId, owner_id: UserId) -> Result<()>;
    async fn view_post(&self, post_id: PostId, user_id: UserId) -> Result<()>;
    async fn like_post(&self, post_id: PostId, user_id: UserId) -> Result<()>;
    async fn dislike_post(&self, post_id: PostId, user_id: UserId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub likes: usize,
    pub dislikes: usize,
    pub views: usize,
    pub replies: usize,
}

/// The four write buffers of one repository.
pub struct InteractionBuffers {
    pub likes: Arc<BatchBuffer<Vec<PendingLike>>>,
    pub dislikes: Arc<BatchBuffer<Vec<PendingDislike>>>,
    pub views: Arc<BatchBuffer<Vec<PendingView>>>,
    pub replies: Arc<BatchBuffer<ReplyBatch>>,
}

impl InteractionBuffers {
    pub fn new<S>(config: &FeedRuntimeConfig, sink: Arc<S>) -> Self
    where
        S: FlushSink<Vec<PendingLike>>
            + FlushSink<Vec<PendingDislike>>
            + FlushSink<Vec<PendingView>>
            + FlushSink<ReplyBatch>
            + 'static,
    {
        Self {
            likes: Arc::new(BatchBuffer::new(
                config.likes,
                sink.clone() as Arc<dyn FlushSink<Vec<PendingLike>>>,
            )),
            dislikes: Arc::new(BatchBuffer::new(
                config.dislikes,
                sink.clone() as Arc<dyn FlushSink<Vec<PendingDislike>>>,
            )),
            views: Arc::new(BatchBuffer::new(
                config.views,
                sink.clone() as Arc<dyn FlushSink<Vec<PendingView>>>,
            )),
            replies: Arc::new(BatchBuffer::new(
                config.replies,
                sink as Arc<dyn FlushSink<ReplyBatch>>,
            )),
        }
    }

    pub fn spawn_timers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.likes.spawn_flush_timer(shutdown.clone()),
            self.dislikes.spawn_flush_timer(shutdown.clone()),
            self.views.spawn_flush_timer(shutdown.clone()),
            self.replies.spawn_flush_timer(shutdown.clone()),
        ]
    }

    /// Queues a like. A dislike of the same pair still waiting in its buffer
    /// is dropped, since the like supersedes it.
    pub async fn like(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        self.dislikes
            .discard(|dislike| dislike.post_id == post_id && dislike.user_id == user_id)
            .await;
        self.likes.append(PendingLike::now(post_id, user_id)).await
    }

    /// Queues a dislike after dropping pending likes of the same pair. The
    /// dislike itself is still queued to remove an already stored like.
    pub async fn dislike(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        let cancelled = self
            .likes
            .discard(|like| like.post_id == post_id && like.user_id == user_id)
            .await;
        if cancelled > 0 {
            tracing::debug!(post_id, user_id, cancelled, "pending likes cancelled by dislike");
        }
        self.dislikes
            .append(PendingDislike { user_id, post_id })
            .await
    }

    pub async fn view(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        self.views.append(PendingView::now(post_id, user_id)).await
    }

    pub async fn reply(&self, parent_id: PostId) -> Result<()> {
        self.replies.append(ReplyIncrement { parent_id }).await
    }

    /// Flushes every buffer now. All buffers are attempted; the first failure
    /// is returned once the others have run.
    pub async fn flush_all(&self) -> Result<Vec<FlushReport>> {
        let outcomes = [
            self.likes.flush_now().await,
            self.dislikes.flush_now().await,
            self.views.flush_now().await,
            self.replies.flush_now().await,
        ];

        let mut reports = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }

    pub async fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            likes: self.likes.len().await,
            dislikes: self.dislikes.len().await,
            views: self.views.len().await,
            replies: self.replies.len().await,
        }
    }

    /// Whether the pair counts as liked once pending events are applied on
    /// top of `stored`.
    async fn effectively_liked(&self, post_id: PostId, user_id: UserId, stored: bool) -> bool {
        let pair = |p: PostId, u: UserId| p == post_id && u == user_id;
        if self.likes.contains(|like| pair(like.post_id, like.user_id)).await {
            return true;
        }
        stored
            && !self
                .dislikes
                .contains(|dislike| pair(dislike.post_id, dislike.user_id))
                .await
    }
}

pub struct PgPostRepository {
    pool: Pool<Postgres>,
    feed: FeedAggregator<PgFeedSource>,
    buffers: InteractionBuffers,
    strict_interactions: bool,
    shutdown: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl PgPostRepository {
    /// Builds the buffers from `config` and starts their flush timers.
    pub fn start(pool: Pool<Postgres>, config: &FeedRuntimeConfig) -> Self {
        Self::start_with_shutdown(pool, config, CancellationToken::new())
    }

    /// Like `start`, with the timers stopping when `shutdown` is cancelled.
    pub fn start_with_shutdown(
        pool: Pool<Postgres>,
        config: &FeedRuntimeConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let pipeline = Arc::new(PgFlushPipeline::new(pool.clone()));
        let buffers = InteractionBuffers::new(config, pipeline);
        let timers = buffers.spawn_timers(&shutdown);

        tracing::info!(
            likes_max_records = config.likes.max_records,
            likes_interval_ms = config.likes.flush_interval.as_millis() as u64,
            views_max_records = config.views.max_records,
            views_interval_ms = config.views.flush_interval.as_millis() as u64,
            strict_interactions = config.strict_interactions,
            "post repository started"
        );

        Self {
            feed: FeedAggregator::new(PgFeedSource::new(pool.clone())),
            pool,
            buffers,
            strict_interactions: config.strict_interactions,
            shutdown,
            timers: Mutex::new(timers),
        }
    }

    pub fn buffers(&self) -> &InteractionBuffers {
        &self.buffers
    }

    pub async fn flush_pending(&self) -> Result<Vec<FlushReport>> {
        self.buffers.flush_all().await
    }

    pub async fn pending_counts(&self) -> PendingCounts {
        self.buffers.pending_counts().await
    }

    /// Stops the flush timers. Whatever is still buffered is abandoned; call
    /// `flush_pending` first to keep it.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let timers = std::mem::take(&mut *self.timers.lock().await);
        for timer in timers {
            if let Err(err) = timer.await {
                tracing::warn!(error = %err, "flush timer task failed");
            }
        }
    }

    async fn stored_interaction(
        &self,
        table: &'static str,
        post_id: i64,
        user_id: i64,
    ) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS (SELECT 1 FROM {table} WHERE post_id = $1 AND user_id = $2)"
        ))
        .bind(post_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl PostRepository for PgPostRepository {
    async fn create_post(&self, post: NewPost) -> Result<Post> {
        let user_id = db_id(post.user_id)?;
        let reply_to_id = post.reply_to_id.map(db_id).transpose()?;

        let row = sqlx::query(
            "INSERT INTO posts (text, reply_to_id, user_id) VALUES ($1, $2, $3) \
             RETURNING id, text, reply_to_id, user_id, created_at",
        )
        .bind(&post.text)
        .bind(reply_to_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let created = Post {
            id: api_id(row.try_get("id")?)?,
            text: row.try_get("text")?,
            reply_to_id: row
                .try_get::<Option<i64>, _>("reply_to_id")?
                .map(api_id)
                .transpose()?,
            user_id: api_id(row.try_get("user_id")?)?,
            created_at: row.try_get("created_at")?,
        };

        if let Some(parent_id) = created.reply_to_id {
            // The post is committed; a failed counter flush is logged by the
            // buffer and must not fail the create.
            if let Err(err) = self.buffers.reply(parent_id).await {
                tracing::warn!(parent_id, error = %err, "reply counter flush failed");
            }
        }

        Ok(created)
    }

    async fn get_all_posts(&self, filter: PostFilter) -> Result<Vec<PostView>> {
        self.feed.page(&filter).await
    }

    async fn get_post_by_id(&self, post_id: PostId, user_id: UserId) -> Result<PostView> {
        self.feed.single(post_id, user_id).await
    }

    async fn delete_post(&self, post_id: PostId, owner_id: UserId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE posts SET deleted_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(db_id(post_id)?)
        .bind(db_id(owner_id)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FeedError::NotFound);
        }
        Ok(())
    }

    async fn view_post(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        let (db_post, db_user) = (db_id(post_id)?, db_id(user_id)?);
        if self.strict_interactions {
            let pending = self
                .buffers
                .views
                .contains(|view| view.post_id == post_id && view.user_id == user_id)
                .await;
            if pending || self.stored_interaction("views", db_post, db_user).await? {
                return Err(FeedError::AlreadyViewed);
            }
        }
        self.buffers.view(post_id, user_id).await
    }

    async fn like_post(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        let (db_post, db_user) = (db_id(post_id)?, db_id(user_id)?);
        if self.strict_interactions {
            let stored = self.stored_interaction("likes", db_post, db_user).await?;
            if self.buffers.effectively_liked(post_id, user_id, stored).await {
                return Err(FeedError::AlreadyLiked);
            }
        }
        self.buffers.like(post_id, user_id).await
    }

    async fn dislike_post(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        let (db_post, db_user) = (db_id(post_id)?, db_id(user_id)?);
        if self.strict_interactions {
            let stored = self.stored_interaction("likes", db_post, db_user).await?;
            if !self.buffers.effectively_liked(post_id, user_id, stored).await {
                return Err(FeedError::NotFound);
            }
        }
        self.buffers.dislike(post_id, user_id).await
    }
}
