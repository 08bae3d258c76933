use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::build::{Build, BuildStatus};
use crate::error::{Error, Result};
use crate::events::{BuildEvent, EventBus};

/// In-memory view of every managed build, keyed by build name.
///
/// Fed exclusively by the watch demultiplexer; reconcilers and the command
/// surface only read snapshots. Eventually consistent with the cluster:
/// writers never assume their cluster mutation is reflected here before the
/// watch echoes it back.
pub struct BuildIndex {
    inner: RwLock<Inner>,
    bus: EventBus,
}

#[derive(Default)]
struct Inner {
    /// False until the initial list has been applied; reads return
    /// `Unavailable` before that.
    ready: bool,
    builds: HashMap<String, Build>,
    status_counts: HashMap<BuildStatus, usize>,
}

impl Inner {
    fn insert(&mut self, build: Build) {
        if let Some(old) = self.builds.insert(build.name.clone(), build.clone()) {
            self.dec(old.status);
        }
        *self.status_counts.entry(build.status).or_default() += 1;
    }

    fn remove(&mut self, name: &str) -> Option<Build> {
        let old = self.builds.remove(name)?;
        self.dec(old.status);
        Some(old)
    }

    fn dec(&mut self, status: BuildStatus) {
        if let Some(count) = self.status_counts.get_mut(&status) {
            *count = count.saturating_sub(1);
        }
    }
}

impl BuildIndex {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn ready(&self) -> bool {
        self.inner.read().await.ready
    }

    /// Insert or replace a build derived from a watch event. Publishes an
    /// `upd` event only when the derived build actually changed.
    pub async fn upsert(&self, build: Build) {
        let mut inner = self.inner.write().await;
        if inner.builds.get(&build.name) == Some(&build) {
            return;
        }
        debug!(name = %build.name, status = ?build.status, "index upsert");
        inner.insert(build.clone());
        self.bus.publish(BuildEvent::Upd(build));
    }

    /// Drop a build after its workload disappeared from the cluster.
    pub async fn remove(&self, name: &str) {
        let mut inner = self.inner.write().await;
        if let Some(build) = inner.remove(name) {
            debug!(%name, "index remove");
            self.bus.publish(BuildEvent::Del(build));
        }
    }

    /// Atomically replace the whole index after a (re-)list, diffing against
    /// the previous content so subscribers see one delta per actual change.
    /// Marks the index ready.
    pub async fn replace_all(&self, builds: Vec<Build>) {
        let mut inner = self.inner.write().await;
        let mut fresh = Inner {
            ready: true,
            ..Inner::default()
        };
        for build in builds {
            fresh.insert(build);
        }
        for (name, old) in &inner.builds {
            if !fresh.builds.contains_key(name) {
                self.bus.publish(BuildEvent::Del(old.clone()));
            }
        }
        for (name, new) in &fresh.builds {
            if inner.builds.get(name) != Some(new) {
                self.bus.publish(BuildEvent::Upd(new.clone()));
            }
        }
        *inner = fresh;
    }

    pub async fn get(&self, name: &str) -> Result<Build> {
        let inner = self.inner.read().await;
        if !inner.ready {
            return Err(Error::Unavailable);
        }
        inner
            .builds
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// All builds, unordered. Errors with `Unavailable` before the initial
    /// list completes so callers never act on a partial view.
    pub async fn snapshot(&self) -> Result<Vec<Build>> {
        let inner = self.inner.read().await;
        if !inner.ready {
            return Err(Error::Unavailable);
        }
        Ok(inner.builds.values().cloned().collect())
    }

    /// Builds for `(repo, target_branch?, pr?)`; omitted filters match all.
    pub async fn search(
        &self,
        repo: Option<&str>,
        target_branch: Option<&str>,
        pr: Option<u64>,
    ) -> Result<Vec<Build>> {
        let repo = repo.map(str::to_lowercase);
        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .filter(|b| repo.as_deref().map_or(true, |r| b.repo == r))
            .filter(|b| target_branch.map_or(true, |t| b.target_branch == t))
            .filter(|b| pr.map_or(true, |p| b.pr == Some(p)))
            .collect())
    }

    pub async fn count(&self, status: BuildStatus) -> usize {
        self.inner
            .read()
            .await
            .status_counts
            .get(&status)
            .copied()
            .unwrap_or(0)
    }

    /// Builds counting against `max_started`: replicas wanted up.
    pub async fn count_started(&self) -> usize {
        let inner = self.inner.read().await;
        inner.status_counts.get(&BuildStatus::Started).copied().unwrap_or(0)
            + inner.status_counts.get(&BuildStatus::Starting).copied().unwrap_or(0)
    }

    /// Builds counting against `max_deployed`: everything not cleaning.
    pub async fn count_deployed(&self) -> usize {
        let inner = self.inner.read().await;
        inner.builds.len()
            - inner
                .status_counts
                .get(&BuildStatus::Cleaning)
                .copied()
                .unwrap_or(0)
    }
}

/// The initializer queue: todo builds, oldest init-status timestamp first.
pub fn todo_queue(snapshot: &[Build]) -> Vec<&Build> {
    let mut queue: Vec<&Build> = snapshot
        .iter()
        .filter(|b| b.status == BuildStatus::Todo && !b.deleted)
        .collect();
    queue.sort_by_key(|b| b.init_status_timestamp);
    queue
}

/// The stopper queue: started builds, least recently scaled first.
pub fn started_queue(snapshot: &[Build]) -> Vec<&Build> {
    let mut queue: Vec<&Build> = snapshot.iter().filter(|b| b.counts_as_started()).collect();
    queue.sort_by_key(|b| b.last_scaled_at);
    queue
}

/// The undeployer queue: evictable (stopped or failed) builds, oldest first.
pub fn eviction_queue(snapshot: &[Build]) -> Vec<&Build> {
    let mut queue: Vec<&Build> = snapshot.iter().filter(|b| b.is_evictable()).collect();
    queue.sort_by_key(|b| b.created_at);
    queue
}
