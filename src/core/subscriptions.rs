//! Reference-counted topic subscriptions.
//!
//! Many independent consumers may want the same `(topic, params)` stream; only the first
//! subscriber produces a wire-level subscribe and only the last unsubscribe produces a
//! wire-level unsubscribe. The set survives reconnects and is replayed on every new
//! connection.

use std::collections::BTreeMap;

/// Identity of one logical subscription on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    topic: String,
    params: BTreeMap<String, String>,
}

impl SubscriptionKey {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            params: BTreeMap::new(),
        }
    }

    /// Topic keyed by a single `id` param, the common shape of domain subscriptions.
    pub fn with_id(topic: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(topic).with_param("id", id)
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

/// Wire-level effect a caller must apply after a subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// First subscriber: a subscribe message is due.
    Added,
    /// Last subscriber left: an unsubscribe message is due.
    Removed,
    /// Only the reference count moved.
    Unchanged,
}

impl SubscriptionChange {
    #[inline]
    pub fn needs_wire_message(self) -> bool {
        !matches!(self, SubscriptionChange::Unchanged)
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    entries: BTreeMap<SubscriptionKey, usize>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, key: SubscriptionKey) -> SubscriptionChange {
        let count = self.entries.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        if *count == 1 {
            SubscriptionChange::Added
        } else {
            SubscriptionChange::Unchanged
        }
    }

    /// Unknown keys (refCount already 0) are a no-op.
    pub fn unsubscribe(&mut self, key: &SubscriptionKey) -> SubscriptionChange {
        let Some(count) = self.entries.get_mut(key) else {
            return SubscriptionChange::Unchanged;
        };
        *count -= 1;
        if *count == 0 {
            self.entries.remove(key);
            SubscriptionChange::Removed
        } else {
            SubscriptionChange::Unchanged
        }
    }

    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.entries.get(key).copied().unwrap_or(0)
    }

    /// Active keys in a stable order (topic, then params).
    pub fn active(&self) -> impl Iterator<Item = &SubscriptionKey> {
        self.entries.keys()
    }

    /// Owned copy of the active set for replay while the manager stays borrowable.
    pub fn replay_set(&self) -> Vec<SubscriptionKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_subscription_survives_one_unsubscribe() {
        let mut manager = SubscriptionManager::new();
        let key = SubscriptionKey::with_id("billing", "org-1");

        assert_eq!(manager.subscribe(key.clone()), SubscriptionChange::Added);
        assert_eq!(manager.subscribe(key.clone()), SubscriptionChange::Unchanged);
        assert_eq!(manager.ref_count(&key), 2);

        assert_eq!(manager.unsubscribe(&key), SubscriptionChange::Unchanged);
        assert_eq!(manager.ref_count(&key), 1);
        assert_eq!(manager.len(), 1);

        assert_eq!(manager.unsubscribe(&key), SubscriptionChange::Removed);
        assert_eq!(manager.unsubscribe(&key), SubscriptionChange::Unchanged);
        assert!(manager.is_empty());
    }

    #[test]
    fn params_distinguish_subscriptions() {
        let mut manager = SubscriptionManager::new();
        let a = SubscriptionKey::with_id("campaign_progress", "c-1");
        let b = SubscriptionKey::with_id("campaign_progress", "c-2");

        assert!(manager.subscribe(a.clone()).needs_wire_message());
        assert!(manager.subscribe(b.clone()).needs_wire_message());
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.unsubscribe(&a), SubscriptionChange::Removed);
        assert_eq!(manager.ref_count(&b), 1);
    }

    #[test]
    fn replay_order_is_stable() {
        let mut manager = SubscriptionManager::new();
        manager.subscribe(SubscriptionKey::with_id("tracking", "t"));
        manager.subscribe(SubscriptionKey::with_id("billing", "b"));
        manager.subscribe(SubscriptionKey::with_id("billing", "a"));

        let first: Vec<_> = manager.replay_set();
        let second: Vec<_> = manager.active().cloned().collect();
        assert_eq!(first, second);

        let order: Vec<(&str, &str)> = first
            .iter()
            .map(|k| (k.topic(), k.params()["id"].as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("billing", "a"), ("billing", "b"), ("tracking", "t")]
        );
    }
}
