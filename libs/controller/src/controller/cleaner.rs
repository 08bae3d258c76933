use super::{RunboatController, TrackedJob};

use tracing::info;

use crate::build::{Build, JobKind};
use crate::error::{Error, Result};
use crate::kubefiles::BundleMode;

impl RunboatController {
    /// Deletion driver: every workload with a deletion timestamp gets one
    /// cleanup job; the finalizer holds the workload until the reaper has
    /// seen that job succeed.
    pub(crate) async fn reconcile_cleaner(&self) -> Result<()> {
        let snapshot = match self.index.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(Error::Unavailable) => return Ok(()),
            Err(e) => return Err(e),
        };
        let jobs = self.jobs_snapshot().await;
        for build in cleanup_candidates(&snapshot, &jobs) {
            info!(build = %build.name, "launching cleanup job");
            let objects = self.render_for_build(build, BundleMode::Cleanup)?;
            self.kube.apply(&objects).await?;
        }
        Ok(())
    }
}

/// Deleted builds without a cleanup job, in flight or terminal.
pub(crate) fn cleanup_candidates<'a>(
    snapshot: &'a [Build],
    jobs: &[TrackedJob],
) -> Vec<&'a Build> {
    snapshot
        .iter()
        .filter(|b| b.deleted)
        .filter(|b| {
            !jobs
                .iter()
                .any(|j| j.kind == JobKind::Cleanup && j.build == b.name)
        })
        .collect()
}
