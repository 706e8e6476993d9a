use std::sync::Arc;
use std::time::Duration;

use smq_codec::Message;
use smq_utils::{timestamp_millis, TimestampMillis};

use crate::types::{DashMap, MessageId};

/// Volatile id -> message map holding messages until they are acknowledged
/// or expire.
#[derive(Default)]
pub struct MessageStore {
    messages: DashMap<MessageId, (Arc<Message>, TimestampMillis)>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites, returning the previous message under `id`.
    #[inline]
    pub fn store(&self, id: MessageId, msg: Arc<Message>) -> Option<Arc<Message>> {
        self.messages.insert(id, (msg, timestamp_millis())).map(|(prev, _)| prev)
    }

    #[inline]
    pub fn get(&self, id: MessageId) -> Option<Arc<Message>> {
        self.messages.get(&id).map(|entry| entry.value().0.clone())
    }

    #[inline]
    pub fn erase(&self, id: MessageId) -> Option<Arc<Message>> {
        self.messages.remove(&id).map(|(_, (msg, _))| msg)
    }

    /// Drops entries stored longer than `expiry` ago, returns how many.
    pub fn remove_expired(&self, expiry: Duration) -> usize {
        if expiry.is_zero() {
            return 0;
        }
        let deadline = timestamp_millis() - expiry.as_millis() as TimestampMillis;
        let before = self.messages.len();
        self.messages.retain(|_, (_, stored_at)| *stored_at > deadline);
        before.saturating_sub(self.messages.len())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
