mod cleaner;
mod initializer;
mod reaper;
mod stopper;
mod undeployer;

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use kube::ResourceExt;
use tokio::sync::{Notify, RwLock};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, instrument, warn, Span};

use crate::build::{Build, BuildStatus, JobKind, LABEL_BUILD, LABEL_JOB_KIND};
use crate::error::Result;
use crate::events::EventBus;
use crate::gateway::Kube;
use crate::index::BuildIndex;
use crate::kubefiles::{self, BundleMode};
use crate::matcher::RepoMatcher;
use crate::metrics::Metrics;
use crate::settings::{BuildRecipe, Settings};
use crate::telemetry;

/// Interval between unsolicited reconcile passes; index deltas wake the
/// reconcilers earlier.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);
/// Pause before re-establishing a watch stream that ended.
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(2);

/// A one-shot job as tracked from the job watch stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedJob {
    pub name: String,
    pub build: String,
    pub kind: JobKind,
    pub state: JobState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Active,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Active)
    }
}

impl TrackedJob {
    /// Track a job carrying both runboat labels; anything else is ignored.
    pub fn from_job(job: &Job) -> Option<TrackedJob> {
        let labels = job.metadata.labels.as_ref()?;
        let build = labels.get(LABEL_BUILD)?.clone();
        let kind = JobKind::parse(labels.get(LABEL_JOB_KIND)?)?;
        let status = job.status.as_ref();
        let state = if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
            JobState::Succeeded
        } else if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
            JobState::Failed
        } else {
            JobState::Active
        };
        Some(TrackedJob {
            name: job.name_any(),
            build,
            kind,
            state,
        })
    }
}

/// The controller: every shared structure lives here and is passed to the
/// reconcilers and handlers explicitly; there is no ambient state.
pub struct RunboatController {
    pub settings: Settings,
    pub matcher: RepoMatcher,
    pub kube: Kube,
    pub index: BuildIndex,
    pub metrics: Metrics,
    jobs: RwLock<HashMap<String, TrackedJob>>,
    jobs_changed: Notify,
}

impl RunboatController {
    pub fn new(settings: Settings, client: Client, metrics: Metrics) -> Result<Arc<Self>> {
        let matcher = RepoMatcher::new(&settings.repos)
            .map_err(|e| crate::error::Error::Rejected(e.to_string()))?;
        let kube = Kube::new(client, settings.build_namespace.clone());
        Ok(Arc::new(Self {
            settings,
            matcher,
            kube,
            index: BuildIndex::new(EventBus::default()),
            metrics,
            jobs: RwLock::new(HashMap::new()),
            jobs_changed: Notify::new(),
        }))
    }

    /// Run watch tasks and reconcilers until `shutdown` fires. Individual
    /// reconciler failures are logged and retried; only cancellation ends
    /// this future.
    pub async fn run(self: &Arc<Self>, shutdown: CancellationToken) {
        info!(namespace = %self.kube.namespace(), "starting controller");
        let c = self;
        tokio::join!(
            c.clone().watch_deployments(shutdown.clone()),
            c.clone().watch_jobs(shutdown.clone()),
            c.reconciler("initializer", &shutdown, |c| async move {
                c.reconcile_initializer().await
            }),
            c.reconciler("reaper", &shutdown, |c| async move {
                c.reconcile_reaper().await
            }),
            c.reconciler("cleaner", &shutdown, |c| async move {
                c.reconcile_cleaner().await
            }),
            c.reconciler("stopper", &shutdown, |c| async move {
                c.reconcile_stopper().await
            }),
            c.reconciler("undeployer", &shutdown, |c| async move {
                c.reconcile_undeployer().await
            }),
        );
        info!("controller stopped");
    }

    /// Drive one reconciler: run a pass on every tick, index delta or job
    /// delta, serializing its own decisions.
    async fn reconciler<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        shutdown: &CancellationToken,
        pass: F,
    ) where
        F: Fn(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deltas = self.index.bus().subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
                _ = self.jobs_changed.notified() => {}
                recv = deltas.recv() => {
                    if recv.is_err() {
                        // lagged: snapshots make individual deltas irrelevant
                        deltas = deltas.resubscribe();
                    }
                }
            }
            if let Err(error) = self.reconcile_once(name, &pass).await {
                self.metrics.reconcile.set_failure(name, &error);
                error!(reconciler = name, %error, "reconcile pass failed");
            }
        }
        debug!(reconciler = name, "reconciler stopped");
    }

    #[instrument(skip(self, pass), fields(trace_id))]
    async fn reconcile_once<F, Fut>(self: &Arc<Self>, name: &'static str, pass: &F) -> Result<()>
    where
        F: Fn(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", field::display(&trace_id));
        let _timer = self.metrics.reconcile.count_and_measure(name, &trace_id);
        pass(self.clone()).await
    }

    /// Watch the build workloads and keep the index consistent with the
    /// cluster. The initial list (and every re-list after a desync) replaces
    /// the index atomically; the stream is re-established forever.
    async fn watch_deployments(self: Arc<Self>, shutdown: CancellationToken) {
        let api = self.kube.deployments();
        let config = watcher::Config::default().labels(LABEL_BUILD).any_semantic();
        loop {
            let mut resync: Option<Vec<Build>> = None;
            let mut stream = pin!(watcher(api.clone(), config.clone()).default_backoff());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.on_deployment_event(event, &mut resync).await,
                        Some(Err(error)) => {
                            self.metrics.watch.failure_inc("deployment");
                            warn!(%error, "deployment watch error");
                        }
                        None => break,
                    }
                }
            }
            warn!("deployment watch stream closed, re-establishing");
            tokio::time::sleep(WATCH_RESTART_DELAY).await;
        }
    }

    async fn on_deployment_event(
        &self,
        event: watcher::Event<Deployment>,
        resync: &mut Option<Vec<Build>>,
    ) {
        self.metrics.watch.event_inc("deployment");
        match event {
            watcher::Event::Init => *resync = Some(Vec::new()),
            watcher::Event::InitApply(deployment) => {
                if let Some(build) = Build::from_deployment(&deployment) {
                    match resync {
                        Some(buffer) => buffer.push(build),
                        None => self.index.upsert(build).await,
                    }
                }
            }
            watcher::Event::InitDone => {
                if let Some(builds) = resync.take() {
                    let count = builds.len();
                    self.index.replace_all(builds).await;
                    self.metrics.watch.ready.set(1);
                    info!(builds = count, "initial list applied, index ready");
                }
            }
            watcher::Event::Apply(deployment) => {
                if let Some(build) = Build::from_deployment(&deployment) {
                    self.index.upsert(build).await;
                }
            }
            watcher::Event::Delete(deployment) => {
                if let Some(name) = deployment
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_BUILD))
                {
                    self.index.remove(name).await;
                }
            }
        }
    }

    /// Watch the one-shot jobs; the reaper and the deletion driver work
    /// from this view.
    async fn watch_jobs(self: Arc<Self>, shutdown: CancellationToken) {
        let api = self.kube.jobs();
        let config = watcher::Config::default()
            .labels(&format!("{LABEL_BUILD},{LABEL_JOB_KIND}"))
            .any_semantic();
        loop {
            let mut resync: Option<HashMap<String, TrackedJob>> = None;
            let mut stream = pin!(watcher(api.clone(), config.clone()).default_backoff());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.on_job_event(event, &mut resync).await,
                        Some(Err(error)) => {
                            self.metrics.watch.failure_inc("job");
                            warn!(%error, "job watch error");
                        }
                        None => break,
                    }
                }
            }
            warn!("job watch stream closed, re-establishing");
            tokio::time::sleep(WATCH_RESTART_DELAY).await;
        }
    }

    async fn on_job_event(
        &self,
        event: watcher::Event<Job>,
        resync: &mut Option<HashMap<String, TrackedJob>>,
    ) {
        self.metrics.watch.event_inc("job");
        match event {
            watcher::Event::Init => *resync = Some(HashMap::new()),
            watcher::Event::InitApply(job) => {
                if let Some(tracked) = TrackedJob::from_job(&job) {
                    match resync {
                        Some(buffer) => {
                            buffer.insert(tracked.name.clone(), tracked);
                        }
                        None => self.track_job(tracked).await,
                    }
                }
            }
            watcher::Event::InitDone => {
                if let Some(jobs) = resync.take() {
                    *self.jobs.write().await = jobs;
                    self.jobs_changed.notify_waiters();
                }
            }
            watcher::Event::Apply(job) => {
                if let Some(tracked) = TrackedJob::from_job(&job) {
                    self.track_job(tracked).await;
                }
            }
            watcher::Event::Delete(job) => {
                let name = job.name_any();
                if self.jobs.write().await.remove(&name).is_some() {
                    self.jobs_changed.notify_waiters();
                }
            }
        }
    }

    async fn track_job(&self, tracked: TrackedJob) {
        let mut jobs = self.jobs.write().await;
        if jobs.get(&tracked.name) != Some(&tracked) {
            debug!(job = %tracked.name, state = ?tracked.state, "job tracked");
            jobs.insert(tracked.name.clone(), tracked);
            drop(jobs);
            self.jobs_changed.notify_waiters();
        }
    }

    pub(crate) async fn jobs_snapshot(&self) -> Vec<TrackedJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub(crate) async fn job_for_build(&self, build: &str, kind: JobKind) -> Option<TrackedJob> {
        self.jobs
            .read()
            .await
            .values()
            .find(|j| j.build == build && j.kind == kind)
            .cloned()
    }

    /// The recipe currently configured for a build. The image recorded on
    /// the workload is immutable and always wins; a build whose rule
    /// disappeared from the configuration keeps working with the default
    /// kubefiles.
    pub(crate) fn recipe_for(&self, build: &Build) -> BuildRecipe {
        match self
            .matcher
            .matches(&build.repo, &build.target_branch)
            .and_then(|recipes| recipes.first())
        {
            Some(recipe) => {
                let mut recipe = recipe.clone();
                recipe.image = build.image.clone();
                recipe
            }
            None => BuildRecipe {
                image: build.image.clone(),
                kubefiles_path: None,
                template_vars: HashMap::new(),
            },
        }
    }

    /// Render one bundle for an existing build.
    pub(crate) fn render_for_build(
        &self,
        build: &Build,
        mode: BundleMode,
    ) -> Result<Vec<kube::api::DynamicObject>> {
        let recipe = self.recipe_for(build);
        let path = self.settings.kubefiles_path_for(&recipe);
        let vars = kubefiles::template_vars(
            &self.settings,
            &recipe,
            &build.name,
            &build.repo,
            &build.target_branch,
            build.pr,
            &build.git_commit,
        );
        kubefiles::render(&path, mode, &build.name, &vars)
    }

    pub(crate) async fn count_initializing(&self) -> usize {
        self.index.count(BuildStatus::Initializing).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_json(name: &str, build: &str, kind: &str, status: serde_json::Value) -> Job {
        serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": "runboat-builds",
                "labels": { LABEL_BUILD: build, LABEL_JOB_KIND: kind }
            },
            "spec": { "template": { "spec": { "containers": [], "restartPolicy": "Never" } } },
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn tracked_job_states() {
        let active = TrackedJob::from_job(&job_json("j1", "b1", "initialize", json!({ "active": 1 })))
            .unwrap();
        assert_eq!(active.state, JobState::Active);
        assert!(!active.state.is_terminal());

        let done =
            TrackedJob::from_job(&job_json("j1", "b1", "initialize", json!({ "succeeded": 1 })))
                .unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(done.state.is_terminal());

        let failed =
            TrackedJob::from_job(&job_json("j1", "b1", "cleanup", json!({ "failed": 1 }))).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.kind, JobKind::Cleanup);
        assert_eq!(failed.build, "b1");
    }

    #[test]
    fn unlabelled_jobs_are_ignored() {
        let job: Job = serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "unrelated" }
        }))
        .unwrap();
        assert!(TrackedJob::from_job(&job).is_none());

        let missing_kind = job_json("j1", "b1", "unknown", json!({}));
        assert!(TrackedJob::from_job(&missing_kind).is_none());
    }
}
