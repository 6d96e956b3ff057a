//! Connection registry: which live connections each user holds right now.
//!
//! The registry is the single source of truth for reachability. It is a
//! sharded concurrent map keyed by user, so operations on one user never
//! contend with another user's. A reverse index resolves the owner of a
//! connection for transport events that only carry the connection id.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use parley_shared::{ConnectionId, UserId};

/// How many live connections one user may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPolicy {
    /// Any number of connections, keyed by `(user, connection)`.
    #[default]
    Multi,
    /// At most one; a new connection replaces the previous one.
    Single,
}

impl FromStr for ConnectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multi" => Ok(Self::Multi),
            "single" => Ok(Self::Single),
            other => Err(format!("unknown connection policy: {other}")),
        }
    }
}

impl fmt::Display for ConnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multi => f.write_str("multi"),
            Self::Single => f.write_str("single"),
        }
    }
}

/// One live transport connection of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub established_at: DateTime<Utc>,
}

pub struct ConnectionRegistry {
    policy: ConnectionPolicy,
    by_user: DashMap<UserId, HashMap<ConnectionId, ConnectionRecord>>,
    owners: DashMap<ConnectionId, UserId>,
}

impl ConnectionRegistry {
    pub fn new(policy: ConnectionPolicy) -> Self {
        Self {
            policy,
            by_user: DashMap::new(),
            owners: DashMap::new(),
        }
    }

    /// Record that `connection_id` belongs to `user_id`.
    ///
    /// Registering the same pair again keeps the original record. Under
    /// [`ConnectionPolicy::Single`] any other connection of the user is
    /// dropped in the same step and returned so the caller can close it.
    pub fn register(&self, user_id: &UserId, connection_id: &ConnectionId) -> Vec<ConnectionId> {
        let mut displaced = Vec::new();

        // Lock order is `by_user` then `owners`; the reverse index changes
        // while the user's entry is held so the two maps never disagree.
        let previous = {
            let mut connections = self.by_user.entry(user_id.clone()).or_default();

            if self.policy == ConnectionPolicy::Single {
                connections.retain(|id, _| {
                    let keep = id == connection_id;
                    if !keep {
                        displaced.push(id.clone());
                    }
                    keep
                });
            }

            connections
                .entry(connection_id.clone())
                .or_insert_with(|| ConnectionRecord {
                    user_id: user_id.clone(),
                    connection_id: connection_id.clone(),
                    established_at: Utc::now(),
                });

            for old in &displaced {
                self.owners.remove_if(old, |_, owner| owner == user_id);
            }
            self.owners.insert(connection_id.clone(), user_id.clone())
        };

        // A connection id handed to a different user earlier is stale for
        // that user now.
        if let Some(previous) = previous.filter(|previous| previous != user_id) {
            self.remove_record(&previous, connection_id);
        }

        debug!(
            user = %user_id,
            connection = %connection_id,
            displaced = displaced.len(),
            "Registered connection"
        );

        displaced
    }

    /// Remove exactly one record. Returns whether it existed.
    pub fn unregister(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let removed = match self.by_user.get_mut(user_id) {
            Some(mut connections) => {
                let removed = connections.remove(connection_id).is_some();
                if removed {
                    self.owners
                        .remove_if(connection_id, |_, owner| owner == user_id);
                }
                removed
            }
            None => false,
        };
        self.by_user
            .remove_if(user_id, |_, connections| connections.is_empty());

        if removed {
            debug!(user = %user_id, connection = %connection_id, "Unregistered connection");
        }
        removed
    }

    /// All live connections of `user_id`; empty when the user has none.
    pub fn resolve(&self, user_id: &UserId) -> HashSet<ConnectionId> {
        self.by_user
            .get(user_id)
            .map(|connections| connections.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The user a live connection belongs to.
    pub fn owner(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.owners.get(connection_id).map(|owner| owner.value().clone())
    }

    pub fn records(&self, user_id: &UserId) -> Vec<ConnectionRecord> {
        self.by_user
            .get(user_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_reachable(&self, user_id: &UserId) -> bool {
        self.by_user
            .get(user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.owners.len()
    }

    fn remove_record(&self, user_id: &UserId, connection_id: &ConnectionId) -> bool {
        let removed = match self.by_user.get_mut(user_id) {
            Some(mut connections) => connections.remove(connection_id).is_some(),
            None => false,
        };
        self.by_user
            .remove_if(user_id, |_, connections| connections.is_empty());
        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(ConnectionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = ConnectionRegistry::default();
        registry.register(&user("u"), &conn("c"));
        let first = registry.records(&user("u"));
        registry.register(&user("u"), &conn("c"));

        let resolved = registry.resolve(&user("u"));
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains(&conn("c")));
        assert_eq!(registry.records(&user("u")), first);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_unregister_missing_is_noop() {
        let registry = ConnectionRegistry::default();
        registry.register(&user("other"), &conn("c9"));

        assert!(!registry.unregister(&user("u"), &conn("c")));
        assert!(!registry.unregister(&user("other"), &conn("c")));
        assert_eq!(registry.resolve(&user("other")), HashSet::from([conn("c9")]));
        assert_eq!(registry.owner(&conn("c9")), Some(user("other")));
    }

    #[test]
    fn test_multi_connection_keeps_all_devices() {
        let registry = ConnectionRegistry::new(ConnectionPolicy::Multi);
        assert!(registry.register(&user("u"), &conn("phone")).is_empty());
        assert!(registry.register(&user("u"), &conn("laptop")).is_empty());

        assert_eq!(
            registry.resolve(&user("u")),
            HashSet::from([conn("phone"), conn("laptop")])
        );

        registry.unregister(&user("u"), &conn("phone"));
        assert_eq!(registry.resolve(&user("u")), HashSet::from([conn("laptop")]));
    }

    #[test]
    fn test_single_connection_last_wins() {
        let registry = ConnectionRegistry::new(ConnectionPolicy::Single);
        registry.register(&user("u"), &conn("old"));

        let displaced = registry.register(&user("u"), &conn("new"));
        assert_eq!(displaced, vec![conn("old")]);
        assert_eq!(registry.resolve(&user("u")), HashSet::from([conn("new")]));
        assert_eq!(registry.owner(&conn("old")), None);

        // Re-registering the surviving connection displaces nothing.
        assert!(registry.register(&user("u"), &conn("new")).is_empty());
    }

    #[test]
    fn test_resolve_unknown_user_is_empty() {
        let registry = ConnectionRegistry::default();
        assert!(registry.resolve(&user("nobody")).is_empty());
        assert!(!registry.is_reachable(&user("nobody")));
    }

    #[test]
    fn test_connection_moving_to_another_user() {
        let registry = ConnectionRegistry::default();
        registry.register(&user("a"), &conn("c"));
        registry.register(&user("b"), &conn("c"));

        assert!(registry.resolve(&user("a")).is_empty());
        assert_eq!(registry.owner(&conn("c")), Some(user("b")));
    }

    #[test]
    fn test_unregister_cleans_reverse_index() {
        let registry = ConnectionRegistry::default();
        registry.register(&user("u"), &conn("c"));
        assert!(registry.unregister(&user("u"), &conn("c")));

        assert_eq!(registry.owner(&conn("c")), None);
        assert_eq!(registry.connection_count(), 0);
        assert!(!registry.is_reachable(&user("u")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_and_unregister_race_stays_consistent() {
        let registry = std::sync::Arc::new(ConnectionRegistry::default());

        for round in 0..200 {
            let c = conn(&format!("c-{round}"));
            let registering = {
                let registry = registry.clone();
                let c = c.clone();
                tokio::spawn(async move {
                    registry.register(&user("u"), &c);
                })
            };
            let unregistering = {
                let registry = registry.clone();
                let c = c.clone();
                tokio::spawn(async move {
                    registry.unregister(&user("u"), &c);
                })
            };
            registering.await.unwrap();
            unregistering.await.unwrap();

            let owned = registry.owner(&c) == Some(user("u"));
            let resolved = registry.resolve(&user("u")).contains(&c);
            assert_eq!(owned, resolved, "round {round}");
            registry.unregister(&user("u"), &c);
        }
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_registrations() {
        let registry = std::sync::Arc::new(ConnectionRegistry::default());
        let mut handles = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let u = user(&format!("user-{}", i % 4));
                let c = conn(&format!("conn-{i}"));
                registry.register(&u, &c);
                if i % 2 == 0 {
                    registry.unregister(&u, &c);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.connection_count(), 16);
        let total: usize = (0..4)
            .map(|i| registry.resolve(&user(&format!("user-{i}"))).len())
            .sum();
        assert_eq!(total, 16);
    }
}
