//! Registry of active subscriptions.
//!
//! Entries are keyed by `(topic type, params)` with value equality, so two
//! requests built independently for the same symbol and timeframe collapse
//! onto one entry. An entry exists exactly as long as at least one
//! connection claims it.

use std::collections::BTreeMap;

use ahash::AHashMap;
use br_core::enums::TopicType;
use serde::{Deserialize, Serialize};

/// Opaque downstream connection identifier.
pub type ConnectionId = String;

/// De-duplication identity of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionKey {
    pub topic_type: TopicType,
    pub params: BTreeMap<String, String>,
}

impl SubscriptionKey {
    /// Key with no params (account-wide topics).
    pub fn singleton(topic_type: TopicType) -> Self {
        Self { topic_type, params: BTreeMap::new() }
    }

    /// `{symbol}` key for book, trade and order topics.
    pub fn symbol(topic_type: TopicType, symbol: &str) -> Self {
        Self::singleton(topic_type).with("symbol", symbol)
    }

    /// `{symbol, timeframe}` key for bar topics.
    pub fn bar(symbol: &str, timeframe: &str) -> Self {
        Self::symbol(TopicType::Bar, symbol).with("timeframe", timeframe)
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }
}

/// One registry entry. `connections` keeps insertion order and holds no
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(flatten)]
    pub key: SubscriptionKey,
    pub connections: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: AHashMap<SubscriptionKey, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `connection` to `key`. Returns `true` when the key was not
    /// subscribed before, i.e. the caller must issue one upstream subscribe.
    pub fn add_subscription(&mut self, connection: &str, key: SubscriptionKey) -> bool {
        match self.entries.get_mut(&key) {
            Some(sub) => {
                if !sub.connections.iter().any(|c| c == connection) {
                    sub.connections.push(connection.to_string());
                }
                false
            }
            None => {
                let sub = Subscription { key: key.clone(), connections: vec![connection.to_string()] };
                self.entries.insert(key, sub);
                true
            }
        }
    }

    /// Detach `connection` from `key`. Returns `true` if that emptied and
    /// removed the entry.
    pub fn remove_connection(&mut self, connection: &str, key: &SubscriptionKey) -> bool {
        let Some(sub) = self.entries.get_mut(key) else {
            return false;
        };
        sub.connections.retain(|c| c != connection);
        if sub.connections.is_empty() {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Detach `connection` everywhere. Returns the keys whose entries were
    /// removed as a result.
    pub fn remove_connection_from_all(&mut self, connection: &str) -> Vec<SubscriptionKey> {
        let mut emptied = Vec::new();
        self.entries.retain(|key, sub| {
            sub.connections.retain(|c| c != connection);
            if sub.connections.is_empty() {
                emptied.push(key.clone());
                false
            } else {
                true
            }
        });
        emptied
    }

    /// Drop an entry regardless of who holds it. Used to undo a
    /// registration whose upstream subscribe failed.
    pub fn remove_key(&mut self, key: &SubscriptionKey) -> Option<Subscription> {
        self.entries.remove(key)
    }

    pub fn exists(&self, key: &SubscriptionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn find(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.entries.get(key)
    }

    /// Snapshot of every entry, sorted by key.
    pub fn snapshot(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self.entries.values().cloned().collect();
        subs.sort_by(|a, b| a.key.cmp(&b.key));
        subs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_equality_dedupes() {
        let mut reg = SubscriptionRegistry::new();
        assert!(reg.add_subscription("A", SubscriptionKey::bar("ADAUSDT", "1h")));
        assert!(!reg.add_subscription("A", SubscriptionKey::bar("ADAUSDT", "1h")));
        assert!(!reg.add_subscription("B", SubscriptionKey::bar("ADAUSDT", "1h")));
        assert!(reg.add_subscription("A", SubscriptionKey::bar("ADAUSDT", "1m")));

        let sub = reg.find(&SubscriptionKey::bar("ADAUSDT", "1h")).unwrap();
        assert_eq!(sub.connections, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn removal_cleans_empty_entries() {
        let mut reg = SubscriptionRegistry::new();
        let key = SubscriptionKey::symbol(TopicType::Book, "ADAUSDT");
        reg.add_subscription("A", key.clone());
        reg.add_subscription("B", key.clone());

        assert!(!reg.remove_connection("A", &key));
        assert_eq!(reg.find(&key).unwrap().connections, vec!["B".to_string()]);
        assert!(reg.remove_connection("B", &key));
        assert!(!reg.exists(&key));
        assert!(!reg.remove_connection("B", &key));
    }

    #[test]
    fn remove_from_all() {
        let mut reg = SubscriptionRegistry::new();
        let account = SubscriptionKey::singleton(TopicType::Account);
        let book = SubscriptionKey::symbol(TopicType::Book, "ADAUSDT");
        reg.add_subscription("A", account.clone());
        reg.add_subscription("A", book.clone());
        reg.add_subscription("B", book.clone());

        let emptied = reg.remove_connection_from_all("A");
        assert_eq!(emptied, vec![account.clone()]);
        assert!(!reg.exists(&account));
        assert_eq!(reg.find(&book).unwrap().connections, vec!["B".to_string()]);

        reg.remove_connection_from_all("B");
        assert!(reg.is_empty());
    }

    #[test]
    fn key_serializes_flat() {
        let mut reg = SubscriptionRegistry::new();
        reg.add_subscription("A", SubscriptionKey::bar("ADAUSDT", "1h"));
        let json = serde_json::to_value(reg.snapshot()).unwrap();
        assert_eq!(json[0]["topicType"], "BAR");
        assert_eq!(json[0]["params"]["timeframe"], "1h");
        assert_eq!(json[0]["connections"][0], "A");
    }
}
