//! Feed read path.
//!
//! A page is assembled from three independent queries run concurrently: the
//! posts themselves, the ids the requester liked and the ids they viewed.
//! The first failing query decides the result and the other two are dropped
//! mid-flight. Reads go straight to storage, so events still sitting in a
//! write buffer are not reflected yet.

use crate::error::{api_id, db_id, FeedError, FeedStage, Result};
use crate::model::{PostAuthor, PostFilter, PostView};
use crate::pending::{PostId, UserId};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use std::future::Future;

/// Storage queries behind a feed read. Results are unannotated:
/// `user_liked`/`user_viewed` are filled in by the aggregator.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn post_page(&self, filter: &PostFilter) -> std::result::Result<Vec<PostView>, sqlx::Error>;

    async fn post_by_id(&self, post_id: PostId)
        -> std::result::Result<Option<PostView>, sqlx::Error>;

    /// Posts liked by `user_id`; all of them, or only `only_post` when given.
    async fn liked_post_ids(
        &self,
        user_id: UserId,
        only_post: Option<PostId>,
    ) -> std::result::Result<HashSet<PostId>, sqlx::Error>;

    async fn viewed_post_ids(
        &self,
        user_id: UserId,
        only_post: Option<PostId>,
    ) -> std::result::Result<HashSet<PostId>, sqlx::Error>;
}

pub struct FeedAggregator<S> {
    source: S,
}

impl<S: FeedSource> FeedAggregator<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub async fn page(&self, filter: &PostFilter) -> Result<Vec<PostView>> {
        db_id(filter.user_id)?;
        if let Some(owner_id) = filter.owner_id {
            db_id(owner_id)?;
        }
        if let Some(reply_to_id) = filter.reply_to_id {
            db_id(reply_to_id)?;
        }

        let (mut posts, liked, viewed) = tokio::try_join!(
            tagged(FeedStage::Page, self.source.post_page(filter)),
            tagged(
                FeedStage::Likes,
                self.source.liked_post_ids(filter.user_id, None)
            ),
            tagged(
                FeedStage::Views,
                self.source.viewed_post_ids(filter.user_id, None)
            ),
        )?;

        annotate(&mut posts, &liked, &viewed);
        Ok(posts)
    }

    pub async fn single(&self, post_id: PostId, user_id: UserId) -> Result<PostView> {
        db_id(post_id)?;
        db_id(user_id)?;

        let (post, liked, viewed) = tokio::try_join!(
            tagged(FeedStage::Page, self.source.post_by_id(post_id)),
            tagged(
                FeedStage::Likes,
                self.source.liked_post_ids(user_id, Some(post_id))
            ),
            tagged(
                FeedStage::Views,
                self.source.viewed_post_ids(user_id, Some(post_id))
            ),
        )?;

        let mut post = post.ok_or(FeedError::NotFound)?;
        post.user_liked = liked.contains(&post.id);
        post.user_viewed = viewed.contains(&post.id);
        Ok(post)
    }
}

async fn tagged<T>(
    stage: FeedStage,
    query: impl Future<Output = std::result::Result<T, sqlx::Error>>,
) -> Result<T> {
    query.await.map_err(|source| {
        tracing::warn!(stage = %stage, error = %source, "feed query failed");
        FeedError::Aggregation { stage, source }
    })
}

fn annotate(posts: &mut [PostView], liked: &HashSet<PostId>, viewed: &HashSet<PostId>) {
    for post in posts {
        post.user_liked = liked.contains(&post.id);
        post.user_viewed = viewed.contains(&post.id);
    }
}

const POST_COLUMNS: &str = "SELECT p.id, p.text, p.reply_to_id, p.created_at, \
     u.id AS author_id, u.user_name, u.first_name, u.last_name, \
     p.likes_count, p.views_count, p.replies_count \
     FROM posts p JOIN users u ON u.id = p.user_id \
     WHERE p.deleted_at IS NULL";

#[derive(Clone)]
pub struct PgFeedSource {
    pool: Pool<Postgres>,
}

impl PgFeedSource {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn interaction_ids(
        &self,
        table: &'static str,
        user_id: UserId,
        only_post: Option<PostId>,
    ) -> std::result::Result<HashSet<PostId>, sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT post_id FROM {table} WHERE user_id = "
        ));
        builder.push_bind(encode_id(user_id)?);
        if let Some(post_id) = only_post {
            builder.push(" AND post_id = ");
            builder.push_bind(encode_id(post_id)?);
        }

        let ids = builder
            .build_query_scalar::<i64>()
            .fetch_all(&self.pool)
            .await?;
        ids.into_iter().map(api_id).collect()
    }
}

#[async_trait]
impl FeedSource for PgFeedSource {
    async fn post_page(&self, filter: &PostFilter) -> std::result::Result<Vec<PostView>, sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(POST_COLUMNS);

        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            builder.push(" AND p.text ILIKE ");
            builder.push_bind(format!("%{}%", escape_like(search)));
        }
        if let Some(owner_id) = filter.owner_id {
            builder.push(" AND p.user_id = ");
            builder.push_bind(encode_id(owner_id)?);
        }
        match filter.reply_to_id {
            Some(reply_to_id) => {
                builder.push(" AND p.reply_to_id = ");
                builder.push_bind(encode_id(reply_to_id)?);
                builder.push(" ORDER BY p.created_at ASC, p.id ASC");
            }
            None => {
                builder.push(" AND p.reply_to_id IS NULL ORDER BY p.created_at DESC, p.id DESC");
            }
        }
        builder.push(" OFFSET ");
        builder.push_bind(clamp_i64(filter.offset));
        builder.push(" LIMIT ");
        builder.push_bind(clamp_i64(filter.limit));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(post_from_row).collect()
    }

    async fn post_by_id(
        &self,
        post_id: PostId,
    ) -> std::result::Result<Option<PostView>, sqlx::Error> {
        let row = sqlx::query(&format!("{POST_COLUMNS} AND p.id = $1"))
            .bind(encode_id(post_id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn liked_post_ids(
        &self,
        user_id: UserId,
        only_post: Option<PostId>,
    ) -> std::result::Result<HashSet<PostId>, sqlx::Error> {
        self.interaction_ids("likes", user_id, only_post).await
    }

    async fn viewed_post_ids(
        &self,
        user_id: UserId,
        only_post: Option<PostId>,
    ) -> std::result::Result<HashSet<PostId>, sqlx::Error> {
        self.interaction_ids("views", user_id, only_post).await
    }
}

fn post_from_row(row: &PgRow) -> std::result::Result<PostView, sqlx::Error> {
    Ok(PostView {
        id: api_id(row.try_get("id")?)?,
        text: row.try_get("text")?,
        reply_to_id: row
            .try_get::<Option<i64>, _>("reply_to_id")?
            .map(api_id)
            .transpose()?,
        user: PostAuthor {
            id: api_id(row.try_get("author_id")?)?,
            user_name: row.try_get("user_name")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
        },
        created_at: row.try_get("created_at")?,
        likes_count: api_id(row.try_get("likes_count")?)?,
        views_count: api_id(row.try_get("views_count")?)?,
        replies_count: api_id(row.try_get("replies_count")?)?,
        user_liked: false,
        user_viewed: false,
    })
}

fn encode_id(id: u64) -> std::result::Result<i64, sqlx::Error> {
    i64::try_from(id).map_err(|err| sqlx::Error::Encode(Box::new(err)))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Matches `search` literally inside ILIKE.
fn escape_like(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len());
    for ch in search.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSource {
        posts: Vec<PostView>,
        liked: HashSet<PostId>,
        viewed: HashSet<PostId>,
        page_delay: Option<Duration>,
        fail_page: bool,
        fail_views: bool,
        page_finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FeedSource for FakeSource {
        async fn post_page(
            &self,
            filter: &PostFilter,
        ) -> std::result::Result<Vec<PostView>, sqlx::Error> {
            if let Some(delay) = self.page_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_page {
                return Err(sqlx::Error::PoolTimedOut);
            }
            self.page_finished.store(true, Ordering::SeqCst);
            Ok(self
                .posts
                .iter()
                .filter(|post| post.reply_to_id == filter.reply_to_id)
                .cloned()
                .collect())
        }

        async fn post_by_id(
            &self,
            post_id: PostId,
        ) -> std::result::Result<Option<PostView>, sqlx::Error> {
            Ok(self.posts.iter().find(|post| post.id == post_id).cloned())
        }

        async fn liked_post_ids(
            &self,
            _user_id: UserId,
            only_post: Option<PostId>,
        ) -> std::result::Result<HashSet<PostId>, sqlx::Error> {
            Ok(scoped(&self.liked, only_post))
        }

        async fn viewed_post_ids(
            &self,
            _user_id: UserId,
            only_post: Option<PostId>,
        ) -> std::result::Result<HashSet<PostId>, sqlx::Error> {
            if self.fail_views {
                return Err(sqlx::Error::Protocol("views unavailable".into()));
            }
            Ok(scoped(&self.viewed, only_post))
        }
    }

    fn scoped(ids: &HashSet<PostId>, only_post: Option<PostId>) -> HashSet<PostId> {
        ids.iter()
            .copied()
            .filter(|id| only_post.map(|only| only == *id).unwrap_or(true))
            .collect()
    }

    fn post(id: PostId) -> PostView {
        PostView {
            id,
            text: format!("post {id}"),
            reply_to_id: None,
            user: PostAuthor {
                id: 1,
                user_name: "author".into(),
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
            },
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            likes_count: 0,
            views_count: 0,
            replies_count: 0,
            user_liked: false,
            user_viewed: false,
        }
    }

    fn filter(user_id: UserId) -> PostFilter {
        PostFilter {
            limit: 20,
            user_id,
            ..PostFilter::default()
        }
    }

    #[tokio::test]
    async fn flags_follow_the_like_and_view_sets() {
        let source = FakeSource {
            posts: (1..=5).map(post).collect(),
            liked: [2, 4, 99].into_iter().collect(),
            viewed: [1, 2].into_iter().collect(),
            ..FakeSource::default()
        };
        let feed = FeedAggregator::new(source);

        let posts = feed.page(&filter(7)).await.unwrap();

        let liked: Vec<PostId> = posts.iter().filter(|p| p.user_liked).map(|p| p.id).collect();
        let viewed: Vec<PostId> = posts.iter().filter(|p| p.user_viewed).map(|p| p.id).collect();
        assert_eq!(posts.len(), 5);
        assert_eq!(liked, vec![2, 4]);
        assert_eq!(viewed, vec![1, 2]);
    }

    #[tokio::test]
    async fn page_order_is_preserved() {
        let source = FakeSource {
            posts: vec![post(3), post(1), post(2)],
            ..FakeSource::default()
        };
        let feed = FeedAggregator::new(source);

        let ids: Vec<PostId> = feed
            .page(&filter(7))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_view_set_short_circuits_slow_page() {
        let page_finished = Arc::new(AtomicBool::new(false));
        let source = FakeSource {
            posts: (1..=3).map(post).collect(),
            page_delay: Some(Duration::from_secs(30)),
            fail_views: true,
            page_finished: page_finished.clone(),
            ..FakeSource::default()
        };
        let feed = FeedAggregator::new(source);
        let started = tokio::time::Instant::now();

        let err = feed.page(&filter(7)).await.unwrap_err();

        assert!(matches!(
            err,
            FeedError::Aggregation {
                stage: FeedStage::Views,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!page_finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn page_failure_is_reported_without_partial_result() {
        let source = FakeSource {
            posts: (1..=3).map(post).collect(),
            fail_page: true,
            ..FakeSource::default()
        };
        let feed = FeedAggregator::new(source);

        let err = feed.page(&filter(7)).await.unwrap_err();
        assert!(matches!(
            err,
            FeedError::Aggregation {
                stage: FeedStage::Page,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn single_post_is_annotated_or_not_found() {
        let source = FakeSource {
            posts: vec![post(10), post(11)],
            liked: [10].into_iter().collect(),
            viewed: [11].into_iter().collect(),
            ..FakeSource::default()
        };
        let feed = FeedAggregator::new(source);

        let ten = feed.single(10, 7).await.unwrap();
        assert!(ten.user_liked);
        assert!(!ten.user_viewed);

        let eleven = feed.single(11, 7).await.unwrap();
        assert!(!eleven.user_liked);
        assert!(eleven.user_viewed);

        assert!(matches!(feed.single(12, 7).await, Err(FeedError::NotFound)));
    }

    #[tokio::test]
    async fn out_of_range_ids_are_rejected_before_querying() {
        let feed = FeedAggregator::new(FakeSource::default());
        let err = feed.page(&filter(u64::MAX)).await.unwrap_err();
        assert!(matches!(err, FeedError::InvalidId(u64::MAX)));
    }

    #[test]
    fn escape_like_treats_wildcards_literally() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }
}
