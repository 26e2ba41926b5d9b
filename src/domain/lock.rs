use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Row in `instance_locks`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceLockRecord {
    pub lock_name: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl InstanceLockRecord {
    /// A holder is live while its last heartbeat is younger than `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.heartbeat_at >= stale_after
    }
}

/// Role this process ended up with after acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceRole {
    ActiveTrader,
    Observer,
}

impl std::fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceRole::ActiveTrader => write!(f, "active_trader"),
            InstanceRole::Observer => write!(f, "observer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_boundary() {
        let now = Utc::now();
        let rec = InstanceLockRecord {
            lock_name: "active_trader".into(),
            instance_id: "1-abc".into(),
            acquired_at: now - Duration::seconds(500),
            heartbeat_at: now - Duration::seconds(120),
            metadata: serde_json::json!({}),
        };
        assert!(rec.is_stale(now, Duration::seconds(120)));
        assert!(!rec.is_stale(now - Duration::seconds(1), Duration::seconds(120)));
    }
}
