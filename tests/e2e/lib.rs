#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    //! End-to-end tests against a live cluster running the controller.
    //!
    //! Requirements: a controller watching the `default` namespace,
    //! configured with a rule matching `acme/e2e` on branch `main` and the
    //! repository's own `kubefiles/` bundle.

    use std::time::Duration;

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::batch::v1::Job;
    use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, Condition};
    use kube::ResourceExt;
    use runboat_controller::build::{
        ANNOTATION_GIT_COMMIT, ANNOTATION_INIT_STATUS, ANNOTATION_REPO, ANNOTATION_TARGET_BRANCH,
        FINALIZER_CLEANUP, LABEL_BUILD,
    };
    use serde_json::json;
    use tokio::time::timeout;

    const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

    fn has_init_status(expected: &'static str) -> impl Condition<Deployment> {
        move |obj: Option<&Deployment>| {
            obj.and_then(|d| d.metadata.annotations.as_ref())
                .and_then(|a| a.get(ANNOTATION_INIT_STATUS))
                .map(|s| s == expected)
                .unwrap_or(false)
        }
    }

    fn is_started() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| {
            obj.and_then(|d| d.status.as_ref())
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0)
                >= 1
        }
    }

    fn is_gone() -> impl Condition<Deployment> {
        |obj: Option<&Deployment>| obj.is_none()
    }

    async fn wait_for<C: Condition<Deployment>>(api: Api<Deployment>, name: &str, condition: C) {
        timeout(
            Duration::from_secs(120),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    /// A workload shaped exactly as `deploy` produces it.
    fn build_workload(name: &str) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "labels": { LABEL_BUILD: name },
                "annotations": {
                    ANNOTATION_REPO: "acme/e2e",
                    ANNOTATION_TARGET_BRANCH: "main",
                    ANNOTATION_GIT_COMMIT: COMMIT,
                    ANNOTATION_INIT_STATUS: "todo",
                },
                "finalizers": [FINALIZER_CLEANUP],
            },
            "spec": {
                "replicas": 0,
                "selector": { "matchLabels": { LABEL_BUILD: name } },
                "template": {
                    "metadata": { "labels": { LABEL_BUILD: name } },
                    "spec": {
                        "containers": [{
                            "name": "app",
                            "image": "registry.example.com/e2e:latest"
                        }]
                    }
                }
            }
        }))
        .unwrap()
    }

    async fn setup(name: &str) -> (Client, Api<Deployment>) {
        let client = Client::try_default().await.unwrap();
        let api = Api::<Deployment>::namespaced(client.clone(), "default");
        api.patch(
            name,
            &PatchParams::apply("e2e-tests").force(),
            &Patch::Apply(&build_workload(name)),
        )
        .await
        .unwrap();
        (client, api)
    }

    #[tokio::test]
    async fn build_is_initialized_and_started() {
        let name = "e2e-lifecycle";
        let (_client, api) = setup(name).await;

        // the initializer admits the build and the reaper promotes it
        wait_for(api.clone(), name, has_init_status("succeeded")).await;
        wait_for(api.clone(), name, is_started()).await;
    }

    #[tokio::test]
    async fn undeployed_build_leaves_no_resources() {
        let name = "e2e-undeploy";
        let (client, api) = setup(name).await;
        wait_for(api.clone(), name, has_init_status("succeeded")).await;

        api.delete(name, &DeleteParams::default()).await.unwrap();
        // the cleanup job must run and the finalizer must go
        wait_for(api.clone(), name, is_gone()).await;

        let jobs = Api::<Job>::namespaced(client, "default")
            .list(&ListParams::default().labels(&format!("{LABEL_BUILD}={name}")))
            .await
            .unwrap();
        assert!(
            jobs.items.is_empty(),
            "leftover jobs: {:?}",
            jobs.items.iter().map(|j| j.name_any()).collect::<Vec<_>>()
        );
    }
}
