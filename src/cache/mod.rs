use std::sync::Arc;

use dashmap::DashMap;

use crate::{common::types::MessageId, rest::ServerMessage};

/// Server-confirmed message entities keyed by snowflake id. The queue
/// materializes send confirmations through here so repeated lookups of the
/// same message share one allocation.
pub struct MessageCache {
    entries: DashMap<MessageId, Arc<ServerMessage>>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the cached entity for `message.id`, inserting `message` if
    /// absent.
    pub fn get_or_add(&self, message: ServerMessage) -> Arc<ServerMessage> {
        self.entries
            .entry(message.id)
            .or_insert_with(|| Arc::new(message))
            .clone()
    }

    pub fn get(&self, id: MessageId) -> Option<Arc<ServerMessage>> {
        self.entries.get(&id).map(|e| e.clone())
    }

    pub fn remove(&self, id: MessageId) -> Option<Arc<ServerMessage>> {
        self.entries.remove(&id).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::ChannelId;

    fn message(id: u64, content: &str) -> ServerMessage {
        ServerMessage {
            id: MessageId(id),
            channel_id: ChannelId(1),
            content: content.to_string(),
            author_id: None,
            nonce: None,
            timestamp: None,
        }
    }

    #[test]
    fn test_get_or_add_inserts_once() {
        let cache = MessageCache::new();
        let first = cache.get_or_add(message(7, "hello"));
        let second = cache.get_or_add(message(7, "different"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.content, "hello");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = MessageCache::new();
        cache.get_or_add(message(7, "hello"));
        assert!(cache.remove(MessageId(7)).is_some());
        assert!(cache.get(MessageId(7)).is_none());
    }
}
