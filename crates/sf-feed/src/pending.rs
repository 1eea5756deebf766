//! Pending interaction events and the per-kind batches they accumulate in.
//!
//! Events live only in process memory between an `append` and the next
//! flush of their buffer.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

pub type PostId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Like,
    Dislike,
    View,
    ReplyIncrement,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Like => "likes",
            EventKind::Dislike => "dislikes",
            EventKind::View => "views",
            EventKind::ReplyIncrement => "replies",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLike {
    pub user_id: UserId,
    pub post_id: PostId,
    pub created_at: DateTime<Utc>,
}

impl PendingLike {
    pub fn now(post_id: PostId, user_id: UserId) -> Self {
        Self {
            user_id,
            post_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDislike {
    pub user_id: UserId,
    pub post_id: PostId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingView {
    pub user_id: UserId,
    pub post_id: PostId,
    pub created_at: DateTime<Utc>,
}

impl PendingView {
    pub fn now(post_id: PostId, user_id: UserId) -> Self {
        Self {
            user_id,
            post_id,
            created_at: Utc::now(),
        }
    }
}

/// One new reply under `parent_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyIncrement {
    pub parent_id: PostId,
}

/// Storage for one kind of pending event inside a `BatchBuffer`.
pub trait PendingBatch: Default + Send + Sync + 'static {
    type Event: Send + 'static;

    const KIND: EventKind;

    fn push(&mut self, event: Self::Event);

    /// Number of appended events; compared against the buffer threshold.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, matches: &dyn Fn(&Self::Event) -> bool) -> bool;

    /// Drops the events matching `remove`, returning how many were dropped.
    fn discard(&mut self, remove: &dyn Fn(&Self::Event) -> bool) -> usize;
}

macro_rules! row_batch {
    ($event:ty, $kind:expr) => {
        impl PendingBatch for Vec<$event> {
            type Event = $event;

            const KIND: EventKind = $kind;

            fn push(&mut self, event: $event) {
                Vec::push(self, event);
            }

            fn len(&self) -> usize {
                Vec::len(self)
            }

            fn contains(&self, matches: &dyn Fn(&$event) -> bool) -> bool {
                self.iter().any(|event| matches(event))
            }

            fn discard(&mut self, remove: &dyn Fn(&$event) -> bool) -> usize {
                let before = Vec::len(self);
                self.retain(|event| !remove(event));
                before - Vec::len(self)
            }
        }
    };
}

row_batch!(PendingLike, EventKind::Like);
row_batch!(PendingDislike, EventKind::Dislike);
row_batch!(PendingView, EventKind::View);

/// Reply increments folded per parent post. `len` counts appended events, not
/// distinct parents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplyBatch {
    increments: HashMap<PostId, u64>,
    events: usize,
}

impl ReplyBatch {
    pub fn increments(&self) -> &HashMap<PostId, u64> {
        &self.increments
    }

    /// Parents sorted by id so concurrent flushes lock post rows in the same
    /// order.
    pub fn sorted_increments(&self) -> Vec<(PostId, u64)> {
        let mut pairs: Vec<(PostId, u64)> = self
            .increments
            .iter()
            .map(|(parent, count)| (*parent, *count))
            .collect();
        pairs.sort_unstable_by_key(|(parent, _)| *parent);
        pairs
    }
}

impl PendingBatch for ReplyBatch {
    type Event = ReplyIncrement;

    const KIND: EventKind = EventKind::ReplyIncrement;

    fn push(&mut self, event: ReplyIncrement) {
        *self.increments.entry(event.parent_id).or_insert(0) += 1;
        self.events += 1;
    }

    fn len(&self) -> usize {
        self.events
    }

    fn contains(&self, matches: &dyn Fn(&ReplyIncrement) -> bool) -> bool {
        self.increments
            .keys()
            .any(|parent_id| matches(&ReplyIncrement { parent_id: *parent_id }))
    }

    fn discard(&mut self, remove: &dyn Fn(&ReplyIncrement) -> bool) -> usize {
        let mut dropped = 0usize;
        self.increments.retain(|parent_id, count| {
            if remove(&ReplyIncrement {
                parent_id: *parent_id,
            }) {
                dropped += *count as usize;
                false
            } else {
                true
            }
        });
        self.events -= dropped;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_batch_folds_per_parent() {
        let mut batch = ReplyBatch::default();
        batch.push(ReplyIncrement { parent_id: 9 });
        batch.push(ReplyIncrement { parent_id: 3 });
        batch.push(ReplyIncrement { parent_id: 9 });

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.increments().len(), 2);
        assert_eq!(batch.sorted_increments(), vec![(3, 1), (9, 2)]);
    }

    #[test]
    fn reply_batch_discard_keeps_event_count_in_step() {
        let mut batch = ReplyBatch::default();
        batch.push(ReplyIncrement { parent_id: 1 });
        batch.push(ReplyIncrement { parent_id: 1 });
        batch.push(ReplyIncrement { parent_id: 2 });

        let dropped = batch.discard(&|event| event.parent_id == 1);
        assert_eq!(dropped, 2);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.sorted_increments(), vec![(2, 1)]);
    }

    #[test]
    fn row_batch_discard_matches_pairs() {
        let mut batch: Vec<PendingLike> = Vec::new();
        PendingBatch::push(&mut batch, PendingLike::now(1, 7));
        PendingBatch::push(&mut batch, PendingLike::now(2, 7));
        PendingBatch::push(&mut batch, PendingLike::now(1, 8));

        let dropped = batch.discard(&|like| like.post_id == 1 && like.user_id == 7);
        assert_eq!(dropped, 1);
        assert_eq!(PendingBatch::len(&batch), 2);
        assert!(!PendingBatch::contains(&batch, &|like| like.post_id == 1 && like.user_id == 7));
        assert!(PendingBatch::contains(&batch, &|like| like.post_id == 1 && like.user_id == 8));
        assert_eq!(<Vec<PendingLike> as PendingBatch>::KIND, EventKind::Like);
    }
}
