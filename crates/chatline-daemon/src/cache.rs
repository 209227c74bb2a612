//! Bounded per-conversation cache of recently observed messages.
//!
//! The messaging session offers no history lookups, so `read` is answered
//! from what the daemon itself has seen. The cache survives restarts through
//! a JSON snapshot in the state directory.

use anyhow::{Context, Result};
use chatline::protocol::CachedMessage;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;
use std::path::Path;

/// Messages kept per conversation.
pub const DEFAULT_CAPACITY: usize = 100;

/// Advisory attached to an empty `read` result.
pub const EMPTY_NOTE: &str =
    "No cached messages for this chat; only messages seen while the daemon is running are available";

/// Snapshot layout: conversation id → messages, oldest first.
type Snapshot = BTreeMap<String, Vec<CachedMessage>>;

pub struct MessageCache {
    capacity: usize,
    chats: HashMap<String, VecDeque<CachedMessage>>,
    dirty: bool,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chats: HashMap::new(),
            dirty: false,
        }
    }

    /// Load a snapshot. A missing or unreadable snapshot yields an empty cache.
    pub fn load(path: &Path, capacity: usize) -> Self {
        let mut cache = Self::new(capacity);
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return cache,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "failed to read message cache, starting empty");
                return cache;
            }
        };
        let snapshot: Snapshot = match serde_json::from_str(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(path = %path.display(), err = %e, "corrupt message cache, starting empty");
                return cache;
            }
        };
        for (chat, messages) in snapshot {
            for message in messages {
                cache.record(&chat, message);
            }
        }
        cache.dirty = false;
        tracing::debug!(chats = cache.chats.len(), "message cache loaded");
        cache
    }

    /// Remember a message. A message whose id is already cached for the chat
    /// is replaced in place; otherwise it is appended and the oldest entries
    /// beyond capacity are dropped.
    pub fn record(&mut self, chat: &str, message: CachedMessage) {
        let entries = self.chats.entry(chat.to_string()).or_default();
        match entries.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => {
                entries.push_back(message);
                while entries.len() > self.capacity {
                    entries.pop_front();
                }
            }
        }
        self.dirty = true;
    }

    /// Replace the text of a cached message. Returns false if it is not cached.
    pub fn apply_edit(&mut self, chat: &str, id: &str, new_text: &str) -> bool {
        let Some(message) = self
            .chats
            .get_mut(chat)
            .and_then(|entries| entries.iter_mut().find(|m| m.id == id))
        else {
            return false;
        };
        message.text = new_text.to_string();
        self.dirty = true;
        true
    }

    /// Forget a cached message. Returns false if it is not cached.
    pub fn remove(&mut self, chat: &str, id: &str) -> bool {
        let Some(entries) = self.chats.get_mut(chat) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|m| m.id != id);
        let removed = entries.len() != before;
        self.dirty |= removed;
        removed
    }

    /// Up to `limit` most recent messages of a chat, newest first.
    pub fn read(&self, chat: &str, limit: usize) -> Vec<CachedMessage> {
        self.chats
            .get(chat)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_messages(&self, chat: &str) -> bool {
        self.chats.get(chat).is_some_and(|entries| !entries.is_empty())
    }

    /// Ids of every chat with cached messages, sorted.
    pub fn known_chats(&self) -> Vec<String> {
        let mut chats: Vec<String> = self
            .chats
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(chat, _)| chat.clone())
            .collect();
        chats.sort();
        chats
    }

    pub fn chat_count(&self) -> usize {
        self.chats.values().filter(|e| !e.is_empty()).count()
    }

    /// Write the snapshot if anything changed since the last flush.
    ///
    /// The file is replaced atomically so a crash mid-write leaves the
    /// previous snapshot intact. Returns whether a write happened.
    pub fn flush(&mut self, path: &Path) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        let snapshot: Snapshot = self
            .chats
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(chat, entries)| (chat.clone(), entries.iter().cloned().collect()))
            .collect();
        let json = serde_json::to_string(&snapshot)?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("failed to write {}", path.display()))?;

        self.dirty = false;
        tracing::debug!(chats = snapshot.len(), path = %path.display(), "message cache flushed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: u64) -> CachedMessage {
        CachedMessage {
            id: id.to_string(),
            from_me: false,
            sender: Some("Bob".into()),
            timestamp: ts,
            text: format!("text {id}"),
            has_media: false,
        }
    }

    #[test]
    fn record_and_read_newest_first() {
        let mut cache = MessageCache::new(DEFAULT_CAPACITY);
        cache.record("team", msg("a", 1));
        cache.record("team", msg("b", 2));
        cache.record("team", msg("c", 3));

        let ids: Vec<_> = cache.read("team", 2).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
        assert!(cache.read("other", 10).is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut cache = MessageCache::new(100);
        for i in 0..150 {
            cache.record("team", msg(&format!("m{i}"), i));
        }
        let all = cache.read("team", 1000);
        assert_eq!(all.len(), 100);
        assert_eq!(all.first().unwrap().id, "m149");
        assert_eq!(all.last().unwrap().id, "m50");
    }

    #[test]
    fn duplicate_ids_are_replaced_in_place() {
        let mut cache = MessageCache::new(10);
        cache.record("team", msg("a", 1));
        cache.record("team", msg("b", 2));
        let mut edited = msg("a", 1);
        edited.text = "edited".into();
        cache.record("team", edited);

        let all = cache.read("team", 10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].text, "edited");
    }

    #[test]
    fn edit_and_remove_touch_only_known_messages() {
        let mut cache = MessageCache::new(10);
        cache.record("team", msg("a", 1));
        assert!(cache.apply_edit("team", "a", "new"));
        assert!(!cache.apply_edit("team", "zz", "new"));
        assert_eq!(cache.read("team", 1)[0].text, "new");
        assert!(cache.has_messages("team"));

        assert!(cache.remove("team", "a"));
        assert!(!cache.remove("team", "a"));
        assert!(cache.known_chats().is_empty());
        assert!(!cache.has_messages("team"));
    }

    #[test]
    fn flush_then_load_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = MessageCache::new(100);
        cache.record("team", msg("a", 1));
        cache.record("family", msg("b", 2));
        assert!(cache.flush(&path).unwrap());
        assert!(!cache.flush(&path).unwrap());

        let mut loaded = MessageCache::load(&path, 100);
        assert_eq!(loaded.known_chats(), vec!["family", "team"]);
        assert_eq!(loaded.read("team", 5), vec![msg("a", 1)]);
        // Nothing changed since the load.
        assert!(!loaded.flush(&path).unwrap());
    }

    #[test]
    fn load_trims_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut big = MessageCache::new(50);
        for i in 0..50 {
            big.record("team", msg(&format!("m{i}"), i));
        }
        big.flush(&path).unwrap();

        let small = MessageCache::load(&path, 10);
        let all = small.read("team", 100);
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].id, "m49");
    }

    #[test]
    fn corrupt_or_missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        assert_eq!(MessageCache::load(&path, 10).chat_count(), 0);

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(MessageCache::load(&path, 10).chat_count(), 0);
    }
}
