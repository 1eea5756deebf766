use crate::pending::{PostId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct NewPost {
    pub text: String,
    pub reply_to_id: Option<PostId>,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub id: PostId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<PostId>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostAuthor {
    pub id: UserId,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
}

/// A post as seen by one requesting user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostView {
    pub id: PostId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<PostId>,
    pub user: PostAuthor,
    pub created_at: DateTime<Utc>,
    pub likes_count: u64,
    pub views_count: u64,
    pub replies_count: u64,
    pub user_liked: bool,
    pub user_viewed: bool,
}

/// Page request. Without `reply_to_id` the page holds top-level posts,
/// newest first; with it, the replies to that post, oldest first.
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    pub search: Option<String>,
    pub owner_id: Option<UserId>,
    pub reply_to_id: Option<PostId>,
    pub limit: u64,
    pub offset: u64,
    pub user_id: UserId,
}
