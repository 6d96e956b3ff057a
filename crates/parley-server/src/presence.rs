//! Heartbeat-driven presence.
//!
//! Presence is independent of live connections: a user is online while
//! their last heartbeat is younger than the threshold, whether or not a
//! socket is open. Timestamps are passed in by the caller.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use parley_shared::UserId;

pub struct PresenceTracker {
    threshold: chrono::Duration,
    last_active: DashMap<UserId, DateTime<Utc>>,
}

impl PresenceTracker {
    pub fn new(online_threshold: Duration) -> Self {
        Self {
            threshold: to_chrono(online_threshold),
            last_active: DashMap::new(),
        }
    }

    /// Record activity of `user_id` at `at`. Never moves backwards.
    pub fn heartbeat(&self, user_id: &UserId, at: DateTime<Utc>) {
        self.last_active
            .entry(user_id.clone())
            .and_modify(|last| {
                if at > *last {
                    *last = at;
                }
            })
            .or_insert(at);
    }

    pub fn last_active(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.last_active.get(user_id).map(|at| *at.value())
    }

    /// A user without a presence record is offline.
    pub fn is_online(&self, user_id: &UserId, now: DateTime<Utc>) -> bool {
        self.last_active(user_id)
            .map(|at| now - at < self.threshold)
            .unwrap_or(false)
    }

    /// The online subset of `candidates`, never containing `excluding`.
    pub fn list_online<'a, I>(
        &self,
        candidates: I,
        now: DateTime<Utc>,
        excluding: Option<&UserId>,
    ) -> HashSet<UserId>
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        candidates
            .into_iter()
            .filter(|user| Some(*user) != excluding)
            .filter(|user| self.is_online(user, now))
            .cloned()
            .collect()
    }

    /// Drop records idle for longer than `retention`. Returns how many.
    pub fn purge_idle(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let retention = to_chrono(retention);
        let before = self.last_active.len();
        self.last_active.retain(|_, at| now - *at < retention);
        let removed = before.saturating_sub(self.last_active.len());
        if removed > 0 {
            debug!(removed, "Purged idle presence records");
        }
        removed
    }

    pub fn tracked_users(&self) -> usize {
        self.last_active.len()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const THRESHOLD: Duration = Duration::from_secs(300);

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_presence_decays_at_threshold() {
        let presence = PresenceTracker::new(THRESHOLD);
        presence.heartbeat(&user("u"), t0());

        let threshold = chrono::Duration::seconds(300);
        let one_ms = chrono::Duration::milliseconds(1);
        assert!(presence.is_online(&user("u"), t0() + threshold - one_ms));
        assert!(!presence.is_online(&user("u"), t0() + threshold));
        assert!(!presence.is_online(&user("u"), t0() + threshold + one_ms));
    }

    #[test]
    fn test_presence_decays_in_seconds() {
        let presence = PresenceTracker::new(THRESHOLD);
        presence.heartbeat(&user("u"), t0());

        assert!(presence.is_online(&user("u"), t0() + chrono::Duration::seconds(299)));
        assert!(!presence.is_online(&user("u"), t0() + chrono::Duration::seconds(301)));
    }

    #[test]
    fn test_missing_record_is_offline() {
        let presence = PresenceTracker::new(THRESHOLD);
        assert!(!presence.is_online(&user("ghost"), t0()));
        assert_eq!(presence.last_active(&user("ghost")), None);
    }

    #[test]
    fn test_heartbeat_never_moves_backwards() {
        let presence = PresenceTracker::new(THRESHOLD);
        let later = t0() + chrono::Duration::seconds(60);
        presence.heartbeat(&user("u"), later);
        presence.heartbeat(&user("u"), t0());
        assert_eq!(presence.last_active(&user("u")), Some(later));
    }

    #[test]
    fn test_list_online_excludes_requester() {
        let presence = PresenceTracker::new(THRESHOLD);
        let now = t0();
        presence.heartbeat(&user("me"), now);
        presence.heartbeat(&user("friend"), now - chrono::Duration::seconds(10));
        presence.heartbeat(&user("stale"), now - chrono::Duration::minutes(10));

        let candidates = [user("me"), user("friend"), user("stale"), user("never")];
        let online = presence.list_online(&candidates, now, Some(&user("me")));
        assert_eq!(online, HashSet::from([user("friend")]));

        let everyone = presence.list_online(&candidates, now, None);
        assert_eq!(everyone, HashSet::from([user("me"), user("friend")]));
    }

    #[test]
    fn test_purge_idle() {
        let presence = PresenceTracker::new(THRESHOLD);
        let now = t0();
        presence.heartbeat(&user("fresh"), now);
        presence.heartbeat(&user("old"), now - chrono::Duration::hours(2));

        assert_eq!(presence.purge_idle(now, Duration::from_secs(3600)), 1);
        assert_eq!(presence.tracked_users(), 1);
        assert!(presence.last_active(&user("old")).is_none());
    }
}
