use super::RunboatController;

use tracing::info;

use crate::build::Build;
use crate::error::{Error, Result};
use crate::index;

impl RunboatController {
    /// Stop the least recently scaled started builds until the fleet fits
    /// under `max_started`. Advisory: a build the user restarts right away
    /// is simply picked up again on a later pass.
    pub(crate) async fn reconcile_stopper(&self) -> Result<()> {
        let snapshot = match self.index.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(Error::Unavailable) => return Ok(()),
            Err(e) => return Err(e),
        };
        for build in stop_victims(&snapshot, self.settings.max_started) {
            info!(build = %build.name, "stopping oldest started build over capacity");
            self.do_stop(build).await?;
        }
        Ok(())
    }
}

/// Started builds beyond capacity, smallest `last_scaled_at` first.
pub(crate) fn stop_victims<'a>(snapshot: &'a [Build], max_started: usize) -> Vec<&'a Build> {
    let queue = index::started_queue(snapshot);
    let excess = queue.len().saturating_sub(max_started);
    queue.into_iter().take(excess).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildStatus;
    use crate::test_util::{at, build};

    #[test]
    fn nothing_to_stop_under_capacity() {
        let snapshot = vec![
            build("s1", BuildStatus::Started),
            build("s2", BuildStatus::Started),
        ];
        assert!(stop_victims(&snapshot, 2).is_empty());
    }

    #[test]
    fn oldest_scaled_is_stopped_first() {
        let mut b1 = build("b1", BuildStatus::Started);
        b1.last_scaled_at = at(1);
        let mut b2 = build("b2", BuildStatus::Started);
        b2.last_scaled_at = at(2);
        let mut b3 = build("b3", BuildStatus::Started);
        b3.last_scaled_at = at(3);
        let snapshot = vec![b3, b1, b2];

        let victims = stop_victims(&snapshot, 2);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].name, "b1");
    }

    #[test]
    fn starting_builds_count_against_capacity() {
        let mut starting = build("warming", BuildStatus::Starting);
        starting.last_scaled_at = at(1);
        let mut started = build("running", BuildStatus::Started);
        started.last_scaled_at = at(2);
        let snapshot = vec![starting, started];

        let victims = stop_victims(&snapshot, 1);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].name, "warming");
    }

    #[test]
    fn stopped_and_todo_builds_are_ignored() {
        let snapshot = vec![
            build("stopped", BuildStatus::Stopped),
            build("todo", BuildStatus::Todo),
            build("failed", BuildStatus::Failed),
        ];
        assert!(stop_victims(&snapshot, 0).is_empty());
    }
}
