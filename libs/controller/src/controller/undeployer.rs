use super::RunboatController;

use tracing::info;

use crate::build::Build;
use crate::error::{Error, Result};
use crate::index;

impl RunboatController {
    /// Undeploy the oldest stopped or failed builds until the total fleet
    /// fits under `max_deployed`. Started and initializing builds are never
    /// evicted here; the stopper shrinks the started set first.
    pub(crate) async fn reconcile_undeployer(&self) -> Result<()> {
        let snapshot = match self.index.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(Error::Unavailable) => return Ok(()),
            Err(e) => return Err(e),
        };
        for build in undeploy_victims(&snapshot, self.settings.max_deployed) {
            info!(build = %build.name, "undeploying oldest build over capacity");
            self.kube.delete_deployment(&build.name).await?;
        }
        Ok(())
    }
}

/// Evictable builds beyond capacity, oldest `created_at` first. The excess
/// is measured over all non-cleaning builds, but only stopped or failed
/// ones may be evicted.
pub(crate) fn undeploy_victims<'a>(snapshot: &'a [Build], max_deployed: usize) -> Vec<&'a Build> {
    let deployed = snapshot.iter().filter(|b| b.is_deployed()).count();
    let excess = deployed.saturating_sub(max_deployed);
    index::eviction_queue(snapshot)
        .into_iter()
        .take(excess)
        .collect()
}
