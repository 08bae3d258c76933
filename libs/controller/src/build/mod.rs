pub mod name;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};

/// Label carried by every resource belonging to a build.
pub const LABEL_BUILD: &str = "runboat/build";
/// Label distinguishing one-shot jobs; value is a [`JobKind`].
pub const LABEL_JOB_KIND: &str = "runboat/job-kind";

pub const ANNOTATION_REPO: &str = "runboat/repo";
pub const ANNOTATION_TARGET_BRANCH: &str = "runboat/target-branch";
pub const ANNOTATION_PR: &str = "runboat/pr";
pub const ANNOTATION_GIT_COMMIT: &str = "runboat/git-commit";
pub const ANNOTATION_INIT_STATUS: &str = "runboat/init-status";
pub const ANNOTATION_INIT_STATUS_TIMESTAMP: &str = "runboat/init-status-timestamp";
pub const ANNOTATION_LAST_SCALED: &str = "runboat/last-scaled";

/// Finalizer keeping the workload around until the cleanup job has run.
pub const FINALIZER_CLEANUP: &str = "runboat/cleanup";

/// Progress of the one-shot initialization job, persisted as a workload
/// annotation so it survives controller restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStatus {
    Todo,
    Started,
    Succeeded,
    Failed,
}

impl InitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitStatus::Todo => "todo",
            InitStatus::Started => "started",
            InitStatus::Succeeded => "succeeded",
            InitStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "todo" => Some(InitStatus::Todo),
            "started" => Some(InitStatus::Started),
            "succeeded" => Some(InitStatus::Succeeded),
            "failed" => Some(InitStatus::Failed),
            _ => None,
        }
    }
}

/// One-shot job kinds, persisted in the `runboat/job-kind` label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Initialize,
    Cleanup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Initialize => "initialize",
            JobKind::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialize" => Some(JobKind::Initialize),
            "cleanup" => Some(JobKind::Cleanup),
            _ => None,
        }
    }
}

/// Externally visible build state, derived from raw cluster fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Todo,
    Initializing,
    Failed,
    Stopped,
    Starting,
    Started,
    Cleaning,
}

/// A managed group of cluster resources for one commit of one branch or PR.
///
/// Everything except `status` is read back from labels and annotations on the
/// workload; the index never stores state the cluster does not hold.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Build {
    pub name: String,
    pub repo: String,
    pub target_branch: String,
    pub pr: Option<u64>,
    pub git_commit: String,
    pub image: String,
    pub created_at: Option<DateTime<Utc>>,
    pub init_status: InitStatus,
    pub init_status_timestamp: Option<DateTime<Utc>>,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub deleted: bool,
    pub last_scaled_at: Option<DateTime<Utc>>,
    pub status: BuildStatus,
}

impl Build {
    /// Derive a build from its workload. Returns `None` for deployments that
    /// do not carry the build label (not managed by us).
    pub fn from_deployment(deployment: &Deployment) -> Option<Build> {
        let meta = &deployment.metadata;
        let name = meta.labels.as_ref()?.get(LABEL_BUILD)?.clone();

        let annotation =
            |key: &str| -> Option<&String> { meta.annotations.as_ref().and_then(|a| a.get(key)) };

        let init_status = annotation(ANNOTATION_INIT_STATUS)
            .and_then(|s| InitStatus::parse(s))
            .unwrap_or(InitStatus::Todo);
        let desired_replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let ready_replicas = deployment
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let deleted = meta.deletion_timestamp.is_some();

        Some(Build {
            status: derive_status(init_status, deleted, desired_replicas, ready_replicas),
            name,
            repo: annotation(ANNOTATION_REPO).cloned().unwrap_or_default(),
            target_branch: annotation(ANNOTATION_TARGET_BRANCH)
                .cloned()
                .unwrap_or_default(),
            pr: annotation(ANNOTATION_PR).and_then(|v| v.parse().ok()),
            git_commit: annotation(ANNOTATION_GIT_COMMIT).cloned().unwrap_or_default(),
            image: deployment
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.containers.first())
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            created_at: meta.creation_timestamp.as_ref().map(|t| t.0),
            init_status,
            init_status_timestamp: annotation(ANNOTATION_INIT_STATUS_TIMESTAMP)
                .and_then(|v| parse_timestamp(v)),
            desired_replicas,
            ready_replicas,
            deleted,
            last_scaled_at: annotation(ANNOTATION_LAST_SCALED).and_then(|v| parse_timestamp(v)),
        })
    }

    /// Home page of the running build.
    pub fn link(&self, build_domain: &str) -> String {
        format!("http://{}.{}", self.name, build_domain)
    }

    /// Builds that still count against `max_deployed`.
    pub fn is_deployed(&self) -> bool {
        self.status != BuildStatus::Cleaning
    }

    /// Builds that count against `max_started` (replicas wanted up).
    pub fn counts_as_started(&self) -> bool {
        !self.deleted && self.init_status == InitStatus::Succeeded && self.desired_replicas > 0
    }

    /// Builds eligible for age-based undeployment.
    pub fn is_evictable(&self) -> bool {
        matches!(self.status, BuildStatus::Stopped | BuildStatus::Failed)
    }
}

/// The state machine as a total function over the raw cluster fields.
fn derive_status(
    init_status: InitStatus,
    deleted: bool,
    desired_replicas: i32,
    ready_replicas: i32,
) -> BuildStatus {
    if deleted {
        return BuildStatus::Cleaning;
    }
    match init_status {
        InitStatus::Todo => BuildStatus::Todo,
        InitStatus::Started => BuildStatus::Initializing,
        InitStatus::Failed => BuildStatus::Failed,
        InitStatus::Succeeded => {
            if desired_replicas == 0 {
                BuildStatus::Stopped
            } else if ready_replicas >= 1 {
                BuildStatus::Started
            } else {
                BuildStatus::Starting
            }
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
