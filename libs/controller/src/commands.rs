use kube::api::DynamicObject;
use serde_json::{json, Value};
use tracing::info;

use crate::build::name::build_name;
use crate::build::{
    Build, BuildStatus, InitStatus, JobKind, ANNOTATION_GIT_COMMIT, ANNOTATION_INIT_STATUS,
    ANNOTATION_INIT_STATUS_TIMESTAMP, ANNOTATION_PR, ANNOTATION_REPO, ANNOTATION_TARGET_BRANCH,
    FINALIZER_CLEANUP,
};
use crate::controller::RunboatController;
use crate::error::{Error, Result};
use crate::gateway::now_rfc3339;
use crate::kubefiles::{self, BundleMode};

/// Synchronous commands, invoked by the REST layer and the webhook path.
/// All transitions are idempotent: repeating one after it took effect does
/// not change observable state.
impl RunboatController {
    pub async fn list_builds(
        &self,
        repo: Option<&str>,
        target_branch: Option<&str>,
        pr: Option<u64>,
    ) -> Result<Vec<Build>> {
        let mut builds = self.index.search(repo, target_branch, pr).await?;
        builds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(builds)
    }

    pub async fn get_build(&self, name: &str) -> Result<Build> {
        self.index.get(name).await
    }

    /// Create a new build for a commit. The workload is deployed stopped,
    /// with `init_status=todo`; the initializer picks it up from there.
    pub async fn deploy(
        &self,
        repo: &str,
        target_branch: &str,
        pr: Option<u64>,
        git_commit: &str,
    ) -> Result<String> {
        let repo = repo.to_lowercase();
        if !is_commit_sha(git_commit) {
            return Err(Error::Rejected(format!(
                "git_commit must be a full 40-character sha, got {git_commit:?}"
            )));
        }
        let recipes = self
            .matcher
            .matches(&repo, target_branch)
            .ok_or_else(|| Error::Rejected(format!("no rule matches {repo}@{target_branch}")))?;
        // names are deterministic per (repo, branch, pr, commit); the first
        // recipe of the matched rule wins
        let recipe = &recipes[0];

        let name = build_name(&repo, target_branch, pr, git_commit);
        match self.index.get(&name).await {
            Ok(_) => return Err(Error::Conflict(format!("build {name} already exists"))),
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(build = %name, %repo, branch = %target_branch, pr, commit = %git_commit, "deploying");
        let path = self.settings.kubefiles_path_for(recipe);
        let vars = kubefiles::template_vars(
            &self.settings,
            recipe,
            &name,
            &repo,
            target_branch,
            pr,
            git_commit,
        );
        let mut objects = kubefiles::render(&path, BundleMode::Deployment, &name, &vars)?;
        decorate_workload(&mut objects, &repo, target_branch, pr, git_commit)?;
        self.kube.apply(&objects).await?;
        Ok(name)
    }

    /// Start a stopped build, or requeue a failed one for initialization.
    /// A build already on its way up is left alone.
    pub async fn start(&self, name: &str) -> Result<()> {
        let build = self.index.get(name).await?;
        match build.status {
            BuildStatus::Stopped => self.do_start(&build).await,
            BuildStatus::Failed => self.kube.patch_init_status(name, InitStatus::Todo).await,
            BuildStatus::Todo
            | BuildStatus::Initializing
            | BuildStatus::Starting
            | BuildStatus::Started => Ok(()),
            BuildStatus::Cleaning => Err(Error::Conflict(format!(
                "build {name} is being cleaned up"
            ))),
        }
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let build = self.index.get(name).await?;
        if build.status == BuildStatus::Cleaning {
            return Err(Error::Conflict(format!("build {name} is being cleaned up")));
        }
        if build.desired_replicas == 0 {
            return Ok(());
        }
        self.do_stop(&build).await
    }

    /// Force re-initialization: back to todo and scaled down. The next
    /// admission runs the initialization job again.
    pub async fn reset(&self, name: &str) -> Result<()> {
        let build = self.index.get(name).await?;
        if build.status == BuildStatus::Cleaning {
            return Err(Error::Conflict(format!("build {name} is being cleaned up")));
        }
        self.kube.patch_init_status(name, InitStatus::Todo).await?;
        if build.desired_replicas != 0 {
            self.kube.scale(name, 0).await?;
        }
        Ok(())
    }

    /// Mark a build for deletion. The cleanup finalizer keeps it visible as
    /// `cleaning` until the cleanup job has run.
    pub async fn undeploy(&self, name: &str) -> Result<()> {
        self.index.get(name).await?;
        self.kube.delete_deployment(name).await
    }

    /// Undeploy every build of a repo, optionally narrowed to a target
    /// branch or PR. Returns how many builds were marked.
    pub async fn undeploy_all(
        &self,
        repo: &str,
        target_branch: Option<&str>,
        pr: Option<u64>,
    ) -> Result<usize> {
        let builds = self.index.search(Some(repo), target_branch, pr).await?;
        let mut count = 0;
        for build in &builds {
            if !build.deleted {
                self.kube.delete_deployment(&build.name).await?;
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn init_log(&self, name: &str) -> Result<String> {
        self.index.get(name).await?;
        self.kube.read_log(name, Some(JobKind::Initialize)).await
    }

    pub async fn build_log(&self, name: &str) -> Result<String> {
        self.index.get(name).await?;
        self.kube.read_log(name, None).await
    }

    pub(crate) async fn do_start(&self, build: &Build) -> Result<()> {
        let objects = self.render_for_build(build, BundleMode::Start)?;
        self.kube.apply(&objects).await?;
        self.kube.scale(&build.name, 1).await
    }

    pub(crate) async fn do_stop(&self, build: &Build) -> Result<()> {
        let objects = self.render_for_build(build, BundleMode::Stop)?;
        self.kube.apply(&objects).await?;
        self.kube.scale(&build.name, 0).await
    }
}

fn is_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Stamp the rendered workload with the persistence contract: identity
/// annotations, `init_status=todo`, the cleanup finalizer, zero replicas.
/// Templates stay free of lifecycle concerns.
fn decorate_workload(
    objects: &mut [DynamicObject],
    repo: &str,
    target_branch: &str,
    pr: Option<u64>,
    git_commit: &str,
) -> Result<()> {
    let mut found = false;
    for object in objects.iter_mut() {
        if object.types.as_ref().map(|t| t.kind.as_str()) != Some("Deployment") {
            continue;
        }
        found = true;
        let annotations = object.metadata.annotations.get_or_insert_with(Default::default);
        annotations.insert(ANNOTATION_REPO.into(), repo.to_string());
        annotations.insert(ANNOTATION_TARGET_BRANCH.into(), target_branch.to_string());
        if let Some(pr) = pr {
            annotations.insert(ANNOTATION_PR.into(), pr.to_string());
        }
        annotations.insert(ANNOTATION_GIT_COMMIT.into(), git_commit.to_string());
        annotations.insert(
            ANNOTATION_INIT_STATUS.into(),
            InitStatus::Todo.as_str().to_string(),
        );
        annotations.insert(ANNOTATION_INIT_STATUS_TIMESTAMP.into(), now_rfc3339());

        let finalizers = object.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == FINALIZER_CLEANUP) {
            finalizers.push(FINALIZER_CLEANUP.to_string());
        }

        match &mut object.data {
            Value::Object(_) => object.data["spec"]["replicas"] = json!(0),
            _ => {
                return Err(Error::Template(
                    "workload document has no object body".into(),
                ))
            }
        }
    }
    if found {
        Ok(())
    } else {
        Err(Error::Template(
            "deployment bundle contains no Deployment".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::settings::{BuildRecipe, RepoRule, Settings};
    use crate::test_util::build;

    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    use http::{Request, Response};
    use kube::client::Body;
    use kube::Client;

    type MockHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    fn settings() -> Settings {
        Settings {
            repos: vec![RepoRule {
                repo: "acme/svc".into(),
                branch: "main".into(),
                builds: vec![BuildRecipe {
                    image: "img:1".into(),
                    kubefiles_path: None,
                    template_vars: HashMap::new(),
                }],
            }],
            build_namespace: "runboat-builds".into(),
            build_domain: "runboat.example.com".into(),
            build_env: HashMap::new(),
            build_secret_env: HashMap::new(),
            build_template_vars: HashMap::new(),
            default_kubefiles_path: PathBuf::from("/nonexistent/kubefiles"),
            max_initializing: 2,
            max_started: 6,
            max_deployed: 60,
            api_admin_user: "admin".into(),
            api_admin_password: "pw".into(),
            github_token: None,
            github_webhook_secret: None,
            base_url: "http://localhost:8080".into(),
            additional_footer_html: None,
        }
    }

    async fn controller_with(builds: Vec<Build>) -> (Arc<RunboatController>, MockHandle) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "runboat-builds");
        let controller =
            RunboatController::new(settings(), client, Metrics::default()).unwrap();
        controller.index.replace_all(builds).await;
        (controller, handle)
    }

    async fn respond_patch(handle: &mut MockHandle) -> serde_json::Value {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PATCH);
        let bytes = request.into_body().collect_bytes().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&serde_json::json!({})).unwrap()))
                .unwrap(),
        );
        body
    }

    #[tokio::test]
    async fn start_on_stopped_scales_up() {
        let (controller, mut handle) =
            controller_with(vec![build("b1", BuildStatus::Stopped)]).await;
        let verify = tokio::spawn(async move {
            let body = respond_patch(&mut handle).await;
            assert_eq!(body["spec"]["replicas"], 1);
        });
        controller.start("b1").await.unwrap();
        verify.await.unwrap();
    }

    #[tokio::test]
    async fn start_on_failed_requeues_initialization() {
        let (controller, mut handle) =
            controller_with(vec![build("b1", BuildStatus::Failed)]).await;
        let verify = tokio::spawn(async move {
            let body = respond_patch(&mut handle).await;
            assert_eq!(body["metadata"]["annotations"][ANNOTATION_INIT_STATUS], "todo");
        });
        controller.start("b1").await.unwrap();
        verify.await.unwrap();
    }

    #[tokio::test]
    async fn start_is_idempotent_on_running_builds() {
        for status in [
            BuildStatus::Todo,
            BuildStatus::Initializing,
            BuildStatus::Starting,
            BuildStatus::Started,
        ] {
            let (controller, _handle) = controller_with(vec![build("b1", status)]).await;
            controller.start("b1").await.unwrap();
        }
    }

    #[tokio::test]
    async fn start_on_cleaning_conflicts() {
        let (controller, _handle) =
            controller_with(vec![build("b1", BuildStatus::Cleaning)]).await;
        assert!(matches!(
            controller.start("b1").await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_at_zero_replicas() {
        let (controller, _handle) =
            controller_with(vec![build("b1", BuildStatus::Stopped)]).await;
        controller.stop("b1").await.unwrap();
    }

    #[tokio::test]
    async fn stop_scales_down_a_started_build() {
        let (controller, mut handle) =
            controller_with(vec![build("b1", BuildStatus::Started)]).await;
        let verify = tokio::spawn(async move {
            let body = respond_patch(&mut handle).await;
            assert_eq!(body["spec"]["replicas"], 0);
        });
        controller.stop("b1").await.unwrap();
        verify.await.unwrap();
    }

    #[tokio::test]
    async fn commands_on_unknown_builds_are_not_found() {
        let (controller, _handle) = controller_with(vec![]).await;
        assert!(matches!(controller.start("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(controller.stop("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(controller.reset("nope").await, Err(Error::NotFound(_))));
        assert!(matches!(controller.undeploy("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn deploy_rejects_unmatched_repos() {
        let (controller, _handle) = controller_with(vec![]).await;
        let result = controller
            .deploy("other/repo", "main", None, &"a".repeat(40))
            .await;
        assert!(matches!(result, Err(Error::Rejected(_))));
    }

    #[tokio::test]
    async fn deploy_rejects_malformed_commits() {
        let (controller, _handle) = controller_with(vec![]).await;
        let result = controller.deploy("acme/svc", "main", None, "abc").await;
        assert!(matches!(result, Err(Error::Rejected(_))));
    }

    #[tokio::test]
    async fn deploy_duplicate_is_a_conflict() {
        let commit = "a".repeat(40);
        let existing = build(
            &crate::build::name::build_name("acme/svc", "main", None, &commit),
            BuildStatus::Started,
        );
        let (controller, _handle) = controller_with(vec![existing]).await;
        let result = controller.deploy("acme/svc", "main", None, &commit).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn commands_are_unavailable_before_initial_list() {
        let (service, _handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "runboat-builds");
        let controller = RunboatController::new(settings(), client, Metrics::default()).unwrap();
        assert!(matches!(
            controller.start("b1").await,
            Err(Error::Unavailable)
        ));
        assert!(matches!(
            controller.deploy("acme/svc", "main", None, &"a".repeat(40)).await,
            Err(Error::Unavailable)
        ));
    }

    fn rendered_workload() -> Vec<DynamicObject> {
        vec![serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "b1" },
            "spec": { "replicas": 1 }
        }))
        .unwrap()]
    }

    #[test]
    fn decorate_workload_applies_the_persistence_contract() {
        let mut objects = rendered_workload();
        decorate_workload(&mut objects, "acme/svc", "main", Some(7), &"a".repeat(40)).unwrap();

        let workload = &objects[0];
        let annotations = workload.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[ANNOTATION_REPO], "acme/svc");
        assert_eq!(annotations[ANNOTATION_TARGET_BRANCH], "main");
        assert_eq!(annotations[ANNOTATION_PR], "7");
        assert_eq!(annotations[ANNOTATION_INIT_STATUS], "todo");
        assert!(annotations.contains_key(ANNOTATION_INIT_STATUS_TIMESTAMP));
        assert_eq!(
            workload.metadata.finalizers.as_ref().unwrap(),
            &vec![FINALIZER_CLEANUP.to_string()]
        );
        // builds always deploy scaled to zero, whatever the template says
        assert_eq!(workload.data["spec"]["replicas"], 0);
    }

    #[test]
    fn decorate_workload_requires_a_deployment() {
        let mut objects: Vec<DynamicObject> = vec![serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "b1" }
        }))
        .unwrap()];
        assert!(decorate_workload(&mut objects, "acme/svc", "main", None, "a").is_err());
    }

    #[test]
    fn commit_sha_validation() {
        assert!(is_commit_sha(&"a".repeat(40)));
        assert!(is_commit_sha("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_commit_sha("main"));
        assert!(!is_commit_sha(&"a".repeat(39)));
        assert!(!is_commit_sha(&"g".repeat(40)));
    }
}
