use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use queue_api::Message;
use serde::{Serialize, Serializer};

/// Identity of a configured topic: `topic` or `project/topic`.
pub type TopicKey = String;

/// Default number of messages retained per topic.
pub const DEFAULT_MAX_MESSAGES: usize = 10;

/// Bounded, newest-first message history for every configured topic.
///
/// A single lock guards the whole mapping so a snapshot never observes a
/// partially applied append.
pub struct Store {
    max_messages: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    version: u64,
    topics: BTreeMap<TopicKey, VecDeque<Message>>,
}

/// Point-in-time copy of the store. Serializes as `{topic: [message, ...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    version: u64,
    topics: BTreeMap<TopicKey, Vec<Message>>,
}

impl Store {
    /// Create a store with an empty history for each of `keys`.
    pub fn new<I, K>(max_messages: usize, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<TopicKey>,
    {
        let topics = keys
            .into_iter()
            .map(|k| (k.into(), VecDeque::new()))
            .collect();
        Self {
            max_messages,
            inner: Mutex::new(Inner { version: 0, topics }),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Insert `msg` at the front of `key`'s history, evicting the oldest
    /// entries beyond `max_messages`. Unknown keys get a new history.
    pub fn append(&self, key: &str, msg: Message) {
        let mut inner = self.inner.lock();
        inner.version += 1;
        let history = inner.topics.entry(key.to_string()).or_default();
        history.push_front(msg);
        history.truncate(self.max_messages);
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            version: inner.version,
            topics: inner
                .topics
                .iter()
                .map(|(key, history)| (key.clone(), history.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Copy of a single topic's history, newest first.
    pub fn history(&self, key: &str) -> Option<Vec<Message>> {
        let inner = self.inner.lock();
        inner
            .topics
            .get(key)
            .map(|history| history.iter().cloned().collect())
    }
}

impl Snapshot {
    /// Number of appends applied to the store when this snapshot was taken.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn topics(&self) -> &BTreeMap<TopicKey, Vec<Message>> {
        &self.topics
    }

    pub fn get(&self, key: &str) -> Option<&[Message]> {
        self.topics.get(key).map(Vec::as_slice)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.topics)
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.topics.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg(id: &str) -> Message {
        Message::new(id, id.as_bytes().to_vec())
    }

    fn ids(history: &[Message]) -> Vec<&str> {
        history.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn evicts_oldest_beyond_bound() {
        let store = Store::new(3, ["orders"]);
        for id in ["m1", "m2", "m3", "m4"] {
            store.append("orders", msg(id));
        }
        let snap = store.snapshot();
        assert_eq!(ids(snap.get("orders").unwrap()), ["m4", "m3", "m2"]);
    }

    #[test]
    fn retains_most_recent_after_every_append() {
        let store = Store::new(4, ["t"]);
        let mut sent = Vec::new();
        for i in 0..12 {
            let id = format!("m{i}");
            store.append("t", msg(&id));
            sent.push(id);
            let history = store.history("t").unwrap();
            assert!(history.len() <= 4);
            let expected: Vec<&str> = sent.iter().rev().take(4).map(String::as_str).collect();
            assert_eq!(ids(&history), expected);
        }
    }

    #[test]
    fn topics_are_isolated() {
        let store = Store::new(2, ["a", "b"]);
        store.append("b", msg("b1"));
        for i in 0..5 {
            store.append("a", msg(&format!("a{i}")));
        }
        assert_eq!(ids(&store.history("b").unwrap()), ["b1"]);
        assert_eq!(ids(&store.history("a").unwrap()), ["a4", "a3"]);
    }

    #[test]
    fn configured_keys_start_empty() {
        let store = Store::new(10, ["a", "b"]);
        let snap = store.snapshot();
        assert_eq!(snap.topics().len(), 2);
        assert!(snap.get("a").unwrap().is_empty());
        assert_eq!(snap.version(), 0);
    }

    #[test]
    fn unknown_key_is_created_on_append() {
        let store = Store::new(10, ["a"]);
        store.append("late", msg("x"));
        assert_eq!(ids(&store.history("late").unwrap()), ["x"]);
    }

    #[test]
    fn huge_retention_does_not_preallocate() {
        let store = Store::new(usize::MAX, ["a"]);
        store.append("a", msg("1"));
        assert_eq!(store.max_messages(), usize::MAX);
        assert_eq!(ids(&store.history("a").unwrap()), ["1"]);
    }

    #[test]
    fn snapshot_serializes_as_plain_mapping() {
        let store = Store::new(10, ["a"]);
        store.append("a", msg("1"));
        let v: serde_json::Value = serde_json::from_slice(&store.snapshot().to_json().unwrap()).unwrap();
        assert_eq!(v["a"][0]["id"], "1");
        assert_eq!(v["a"][0]["data"], "MQ==");
        assert!(v.get("version").is_none());
    }

    #[test]
    fn concurrent_snapshots_never_exceed_bound() {
        let store = Arc::new(Store::new(5, ["a", "b"]));
        let writers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        store.append(key, msg(&format!("{key}{i}")));
                    }
                })
            })
            .collect();
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..2_000 {
                    let snap = store.snapshot();
                    assert!(snap.version() >= last);
                    last = snap.version();
                    for history in snap.topics().values() {
                        assert!(history.len() <= 5);
                        for m in history {
                            assert_eq!(m.data.as_ref(), m.id.as_bytes());
                        }
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.version(), 4_000);
        assert_eq!(ids(snap.get("a").unwrap())[0], "a1999");
        assert_eq!(ids(snap.get("b").unwrap())[0], "b1999");
    }
}
