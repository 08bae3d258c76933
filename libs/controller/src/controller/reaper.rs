use super::{JobState, RunboatController, TrackedJob};

use tracing::{error, info, warn};

use crate::build::{InitStatus, JobKind};
use crate::error::{Error, Result};
use crate::kubefiles::BundleMode;

impl RunboatController {
    /// React to terminal one-shot jobs: promote or fail initializations,
    /// finish cleanups.
    pub(crate) async fn reconcile_reaper(&self) -> Result<()> {
        if !self.index.ready().await {
            return Ok(());
        }
        for job in self.jobs_snapshot().await {
            if !job.state.is_terminal() {
                continue;
            }
            match job.kind {
                JobKind::Initialize => self.reap_initialize(&job).await?,
                JobKind::Cleanup => self.reap_cleanup(&job).await?,
            }
        }
        Ok(())
    }

    async fn reap_initialize(&self, job: &TrackedJob) -> Result<()> {
        let build = match self.index.get(&job.build).await {
            Ok(build) => build,
            // the workload is gone; the job is an orphan
            Err(Error::NotFound(_)) => return self.kube.delete_job(&job.name).await,
            Err(e) => return Err(e),
        };
        // never touch a build that is being cleaned up
        if build.deleted {
            return Ok(());
        }
        match job.state {
            JobState::Succeeded => {
                if build.init_status == InitStatus::Started {
                    info!(build = %build.name, "initialization succeeded");
                    self.kube
                        .patch_init_status(&build.name, InitStatus::Succeeded)
                        .await?;
                    // fresh builds start once; later lifecycle is user-driven
                    let objects = self.render_for_build(&build, BundleMode::Start)?;
                    self.kube.apply(&objects).await?;
                    self.kube.scale(&build.name, 1).await?;
                }
                if build.init_status != InitStatus::Todo {
                    self.kube.delete_job(&job.name).await?;
                }
                Ok(())
            }
            JobState::Failed => {
                // the failed job is kept so its log stays inspectable; the
                // initializer removes it when the build is re-admitted
                if build.init_status == InitStatus::Started {
                    warn!(build = %build.name, "initialization failed");
                    self.kube
                        .patch_init_status(&build.name, InitStatus::Failed)
                        .await?;
                    if build.desired_replicas != 0 {
                        self.kube.scale(&build.name, 0).await?;
                    }
                }
                Ok(())
            }
            JobState::Active => Ok(()),
        }
    }

    async fn reap_cleanup(&self, job: &TrackedJob) -> Result<()> {
        match job.state {
            JobState::Succeeded => {
                info!(build = %job.build, "cleanup succeeded, deleting build resources");
                self.kube.delete_by_label(&job.build).await?;
                self.kube.remove_finalizer(&job.build).await
            }
            JobState::Failed => {
                error!(build = %job.build, job = %job.name, "cleanup job failed, will retry");
                // dropping the failed job makes the deletion driver apply a
                // fresh one on its next pass
                self.kube.delete_job(&job.name).await
            }
            JobState::Active => Ok(()),
        }
    }
}
