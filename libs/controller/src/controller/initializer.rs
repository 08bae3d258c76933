use super::RunboatController;

use tracing::info;

use crate::build::{Build, InitStatus, JobKind};
use crate::error::{Error, Result};
use crate::index;
use crate::kubefiles::BundleMode;

impl RunboatController {
    /// Admit todo builds into initialization while capacity remains. The
    /// init-status patch is written before the job is applied, so a crashed
    /// controller over-counts rather than over-admits.
    pub(crate) async fn reconcile_initializer(&self) -> Result<()> {
        let snapshot = match self.index.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(Error::Unavailable) => return Ok(()),
            Err(e) => return Err(e),
        };
        let in_flight = self.count_initializing().await;
        for build in admissions(&snapshot, in_flight, self.settings.max_initializing) {
            self.admit(build).await?;
        }
        Ok(())
    }

    async fn admit(&self, build: &Build) -> Result<()> {
        // the index snapshot may lag our own writes; re-read before taking
        // the admission lease and yield if the build moved on
        let Some(deployment) = self.kube.get_deployment(&build.name).await? else {
            return Ok(());
        };
        match Build::from_deployment(&deployment) {
            Some(current) if current.init_status == InitStatus::Todo && !current.deleted => {}
            _ => return Ok(()),
        }

        info!(build = %build.name, "admitting initialization");
        // a previous attempt may have left a terminal job behind; job specs
        // are immutable so it has to go before the new one is applied
        if let Some(job) = self.job_for_build(&build.name, JobKind::Initialize).await {
            if job.state.is_terminal() {
                self.kube.delete_job(&job.name).await?;
            }
        }
        self.kube
            .patch_init_status(&build.name, InitStatus::Started)
            .await?;
        let objects = self.render_for_build(build, BundleMode::Initialize)?;
        self.kube.apply(&objects).await
    }
}

/// Oldest todo builds that fit under `max_initializing`, given how many
/// initializations are already in flight.
pub(crate) fn admissions<'a>(
    snapshot: &'a [Build],
    in_flight: usize,
    max_initializing: usize,
) -> Vec<&'a Build> {
    let capacity = max_initializing.saturating_sub(in_flight);
    index::todo_queue(snapshot)
        .into_iter()
        .take(capacity)
        .collect()
}
