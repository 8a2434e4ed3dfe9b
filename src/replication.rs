//! Process-wide Replication State
//!
//! Two flags are shared by every component: the node's replication role and
//! the shutdown request. Both are mutated from outside the core (the
//! replication layer elects a master, the process receives a signal) and
//! both are read at loop-iteration boundaries.
//!
//! [`NodeState`] is cheap to clone and is handed to each component
//! explicitly instead of living in a global.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Replication role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationRole {
    /// Accepts writes and creates tables
    Master,
    /// Read-only replica; waits for the master to create tables
    #[default]
    Client,
}

impl ReplicationRole {
    pub fn is_master(self) -> bool {
        self == ReplicationRole::Master
    }
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationRole::Master => write!(f, "master"),
            ReplicationRole::Client => write!(f, "client"),
        }
    }
}

impl std::str::FromStr for ReplicationRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" | "m" => Ok(ReplicationRole::Master),
            "client" | "c" | "replica" => Ok(ReplicationRole::Client),
            other => Err(format!("unknown replication role: {}", other)),
        }
    }
}

struct Inner {
    role: watch::Sender<ReplicationRole>,
    shutdown: CancellationToken,
}

/// Shared, observable role + shutdown state.
#[derive(Clone)]
pub struct NodeState {
    inner: Arc<Inner>,
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("role", &self.role())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::new(ReplicationRole::default())
    }
}

impl NodeState {
    pub fn new(role: ReplicationRole) -> Self {
        let (role, _) = watch::channel(role);
        Self {
            inner: Arc::new(Inner {
                role,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Current replication role.
    pub fn role(&self) -> ReplicationRole {
        *self.inner.role.borrow()
    }

    pub fn is_master(&self) -> bool {
        self.role().is_master()
    }

    /// Records a role change decided by the replication layer.
    pub fn set_role(&self, role: ReplicationRole) {
        let previous = self.inner.role.send_replace(role);
        if previous != role {
            info!(from = %previous, to = %role, "Replication role changed");
        }
    }

    /// Watches role changes.
    pub fn subscribe_role(&self) -> watch::Receiver<ReplicationRole> {
        self.inner.role.subscribe()
    }

    /// Requests a cooperative shutdown of every loop sharing this state.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token that resolves once shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Sleeps for at most `duration`, waking early on shutdown.
    ///
    /// Returns `true` if shutdown was requested before or during the wait.
    pub async fn sleep_or_shutdown(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.inner.shutdown.cancelled() => {}
        }
        self.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_role_parse_and_display() {
        assert_eq!("master".parse::<ReplicationRole>(), Ok(ReplicationRole::Master));
        assert_eq!("Client".parse::<ReplicationRole>(), Ok(ReplicationRole::Client));
        assert!("leader".parse::<ReplicationRole>().is_err());
        assert_eq!(ReplicationRole::Master.to_string(), "master");
    }

    #[test]
    fn test_role_changes_are_observable() {
        let state = NodeState::new(ReplicationRole::Client);
        let rx = state.subscribe_role();
        assert!(!state.is_master());

        state.clone().set_role(ReplicationRole::Master);
        assert!(state.is_master());
        assert_eq!(*rx.borrow(), ReplicationRole::Master);
    }

    #[tokio::test]
    async fn test_sleep_returns_immediately_when_shut_down() {
        let state = NodeState::default();
        state.shutdown();
        let start = Instant::now();
        assert!(state.sleep_or_shutdown(Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_shutdown() {
        let state = NodeState::default();
        let waiter = state.clone();
        let handle =
            tokio::spawn(async move { waiter.sleep_or_shutdown(Duration::from_secs(10)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.shutdown();

        let woke = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleeper should wake promptly")
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_sleep_expires_normally() {
        let state = NodeState::default();
        assert!(!state.sleep_or_shutdown(Duration::from_millis(10)).await);
    }
}
