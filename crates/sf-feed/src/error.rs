use crate::pending::EventKind;
use std::fmt;
use thiserror::Error;

/// Which of the three fan-out queries of a feed read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStage {
    Page,
    Likes,
    Views,
}

impl FeedStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStage::Page => "page",
            FeedStage::Likes => "likes",
            FeedStage::Views => "views",
        }
    }
}

impl fmt::Display for FeedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("not found")]
    NotFound,

    #[error("post already liked")]
    AlreadyLiked,

    #[error("post already viewed")]
    AlreadyViewed,

    #[error("identifier {0} is outside the storage range")]
    InvalidId(u64),

    #[error("{kind} flush failed: {source}")]
    Transaction {
        kind: EventKind,
        #[source]
        source: sqlx::Error,
    },

    #[error("feed {stage} query failed: {source}")]
    Aggregation {
        stage: FeedStage,
        #[source]
        source: sqlx::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Ids are unsigned at the API and `BIGINT` in storage.
pub fn db_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| FeedError::InvalidId(id))
}

pub(crate) fn api_id(value: i64) -> std::result::Result<u64, sqlx::Error> {
    u64::try_from(value).map_err(|err| sqlx::Error::Decode(Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_id_rejects_values_above_bigint() {
        assert_eq!(db_id(42).unwrap(), 42);
        assert!(matches!(db_id(u64::MAX), Err(FeedError::InvalidId(u64::MAX))));
    }

    #[test]
    fn api_id_rejects_negative_rows() {
        assert_eq!(api_id(7).unwrap(), 7);
        assert!(api_id(-1).is_err());
    }

    #[test]
    fn aggregation_error_names_the_stage() {
        let err = FeedError::Aggregation {
            stage: FeedStage::Views,
            source: sqlx::Error::Protocol("connection reset".into()),
        };
        let message = err.to_string();
        assert!(message.starts_with("feed views query failed"));
        assert!(message.contains("connection reset"));
    }
}
