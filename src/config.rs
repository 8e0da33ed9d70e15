use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{CommId, PaxosGroup, PaxosGroupId};

/// The cluster view handed down by the coordinator service: this
/// replica's identity, its home group, and the home group of every
/// participating data center.
///
/// A configuration is plain data; the daemon holds it behind a
/// [`ConfigHandle`] and swaps the whole snapshot on reconfiguration.
///
/// # Examples
///
/// ```no_run
/// use txman::{CommId, Config, PaxosGroup, PaxosGroupId};
///
/// let home = PaxosGroup::new(PaxosGroupId(1), vec![CommId(1), CommId(2), CommId(3)]);
/// let config = Config {
///     us: CommId(1),
///     home: home.clone(),
///     groups: vec![home],
///     offline: Vec::new(),
///     collect_after_ticks: 4,
/// };
/// // the lowest live member leads the group
/// assert!(config.is_leader(&config.home));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This replica.
    pub us: CommId,
    /// The home group this replica serves in.
    pub home: PaxosGroup,
    /// One home group per data center, `home` included.
    pub groups: Vec<PaxosGroup>,
    /// Members the coordinator currently believes dead; excluded from
    /// leader selection.
    pub offline: Vec<CommId>,
    /// Background ticks a terminated transaction lingers before it is
    /// collected, leaving a window to replay duplicate responses.
    pub collect_after_ticks: u32,
}

impl Config {
    pub fn group(&self, id: PaxosGroupId) -> Option<&PaxosGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// The group ids of every data center, ordered.
    pub fn data_centers(&self) -> Vec<PaxosGroupId> {
        self.groups.iter().map(|g| g.id).collect()
    }

    /// The lowest-ordered live member of `group`.
    pub fn leader(&self, group: &PaxosGroup) -> Option<CommId> {
        group
            .members
            .iter()
            .copied()
            .find(|m| !self.offline.contains(m))
    }

    pub fn is_leader(&self, group: &PaxosGroup) -> bool {
        self.leader(group) == Some(self.us)
    }
}

/// Read-mostly handle on the configuration. Readers take a cheap `Arc`
/// snapshot; a reconfiguration swaps the pointer without disturbing
/// handlers already running against the old view.
pub struct ConfigHandle {
    inner: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    pub fn swap(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }
}
