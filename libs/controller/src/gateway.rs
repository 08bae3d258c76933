use std::fmt::Debug;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::{Client, Discovery};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::OnceCell;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::build::{
    InitStatus, JobKind, ANNOTATION_INIT_STATUS, ANNOTATION_INIT_STATUS_TIMESTAMP,
    ANNOTATION_LAST_SCALED, FINALIZER_CLEANUP, LABEL_BUILD, LABEL_JOB_KIND,
};
use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "runboat";

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(250);
const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(30);

/// Thin gateway over the cluster API for one build namespace.
///
/// Every call retries transient errors with exponential backoff, capped at
/// 30 s elapsed; non-retryable errors surface to the caller. All mutations
/// are idempotent so reconcilers can repeat them freely.
pub struct Kube {
    client: Client,
    namespace: String,
    discovery: OnceCell<Discovery>,
}

impl Kube {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            discovery: OnceCell::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        let api = self.deployments();
        with_retry("get deployment", || api.get_opt(name)).await
    }

    /// Merge-patch the init status annotation pair with a fresh timestamp.
    pub async fn patch_init_status(&self, name: &str, status: InitStatus) -> Result<()> {
        let patch = Patch::Merge(json!({
            "metadata": {
                "annotations": {
                    ANNOTATION_INIT_STATUS: status.as_str(),
                    ANNOTATION_INIT_STATUS_TIMESTAMP: now_rfc3339(),
                }
            }
        }));
        let api = self.deployments();
        let params = PatchParams::default();
        with_retry("patch init status", || api.patch(name, &params, &patch)).await?;
        Ok(())
    }

    /// Set `spec.replicas`, stamping the last-scaled annotation used for
    /// age-based stopping.
    pub async fn scale(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = Patch::Merge(json!({
            "metadata": {
                "annotations": { ANNOTATION_LAST_SCALED: now_rfc3339() }
            },
            "spec": { "replicas": replicas }
        }));
        let api = self.deployments();
        let params = PatchParams::default();
        with_retry("scale deployment", || api.patch(name, &params, &patch)).await?;
        Ok(())
    }

    /// Server-side apply a rendered bundle.
    pub async fn apply(&self, objects: &[DynamicObject]) -> Result<()> {
        for object in objects {
            let name = object
                .metadata
                .name
                .as_deref()
                .ok_or_else(|| Error::Template("rendered resource without a name".into()))?;
            let types = object
                .types
                .as_ref()
                .ok_or_else(|| Error::Template("rendered resource without apiVersion/kind".into()))?;
            let (group, version) = match types.api_version.split_once('/') {
                Some((group, version)) => (group, version),
                None => ("", types.api_version.as_str()),
            };
            let gvk = GroupVersionKind::gvk(group, version, &types.kind);
            let (resource, _caps) = self
                .discovery()
                .await?
                .resolve_gvk(&gvk)
                .ok_or_else(|| {
                    Error::Template(format!("unknown resource kind {}/{}", gvk.group, gvk.kind))
                })?;
            let api: Api<DynamicObject> =
                Api::namespaced_with(self.client.clone(), &self.namespace, &resource);
            let params = PatchParams::apply(FIELD_MANAGER).force();
            let patch = Patch::Apply(object);
            debug!(kind = %types.kind, %name, "applying resource");
            with_retry("apply resource", || api.patch(name, &params, &patch)).await?;
        }
        Ok(())
    }

    /// Delete the build's workload; the cleanup finalizer keeps it (and the
    /// build) visible until the cleanup job has run.
    pub async fn delete_deployment(&self, name: &str) -> Result<()> {
        let api = self.deployments();
        let params = DeleteParams::default();
        match with_retry("delete deployment", || api.delete(name, &params)).await {
            Ok(_) => Ok(()),
            Err(Error::Kube {
                source: kube::Error::Api(e),
            }) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete a one-shot job and its pods.
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        let api = self.jobs();
        let params = DeleteParams::background();
        match with_retry("delete job", || api.delete(name, &params)).await {
            Ok(_) => Ok(()),
            Err(Error::Kube {
                source: kube::Error::Api(e),
            }) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete every resource labelled `runboat/build=<name>`, across all
    /// kinds a kubefiles bundle may produce.
    pub async fn delete_by_label(&self, build_name: &str) -> Result<()> {
        let selector = format!("{LABEL_BUILD}={build_name}");
        self.delete_labelled::<Job>(&selector).await?;
        self.delete_labelled::<Service>(&selector).await?;
        self.delete_labelled::<Ingress>(&selector).await?;
        self.delete_labelled::<PersistentVolumeClaim>(&selector).await?;
        self.delete_labelled::<ConfigMap>(&selector).await?;
        self.delete_labelled::<Secret>(&selector).await?;
        self.delete_labelled::<Deployment>(&selector).await?;
        Ok(())
    }

    /// Remove the cleanup finalizer so the cluster can collect the workload.
    /// Retries on write conflicts with a re-read.
    pub async fn remove_finalizer(&self, name: &str) -> Result<()> {
        let api = self.deployments();
        loop {
            let Some(deployment) = self.get_deployment(name).await? else {
                return Ok(());
            };
            let Some(finalizers) = deployment.metadata.finalizers.as_ref() else {
                return Ok(());
            };
            if !finalizers.iter().any(|f| f == FINALIZER_CLEANUP) {
                return Ok(());
            }
            let remaining: Vec<&String> =
                finalizers.iter().filter(|f| *f != FINALIZER_CLEANUP).collect();
            let patch = Patch::Merge(json!({ "metadata": { "finalizers": remaining } }));
            let params = PatchParams::default();
            match with_retry("remove finalizer", || api.patch(name, &params, &patch)).await {
                Ok(_) => return Ok(()),
                Err(Error::Kube {
                    source: kube::Error::Api(e),
                }) if e.code == 409 => continue,
                Err(Error::Kube {
                    source: kube::Error::Api(e),
                }) if e.code == 404 => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Tail of the most recent pod log for a build. With a job kind the
    /// selector targets that job's pods; without, the workload pods.
    pub async fn read_log(&self, build_name: &str, job_kind: Option<JobKind>) -> Result<String> {
        let selector = match job_kind {
            Some(kind) => format!("{LABEL_BUILD}={build_name},{LABEL_JOB_KIND}={}", kind.as_str()),
            None => format!("{LABEL_BUILD}={build_name},!{LABEL_JOB_KIND}"),
        };
        let pods = self.pods();
        let list_params = ListParams::default().labels(&selector);
        let list = with_retry("list pods", || pods.list(&list_params)).await?;
        let newest = list
            .items
            .iter()
            .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0))
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| Error::NotFound(format!("no pods for {build_name}")))?;
        let params = LogParams {
            tail_lines: Some(10_000),
            ..LogParams::default()
        };
        with_retry("read pod log", || pods.logs(&newest, &params)).await
    }

    async fn delete_labelled<K>(&self, selector: &str) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &self.namespace);
        let delete_params = DeleteParams::default();
        let list_params = ListParams::default().labels(selector);
        with_retry("delete collection", || {
            api.delete_collection(&delete_params, &list_params)
        })
        .await?;
        Ok(())
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                Discovery::new(self.client.clone())
                    .run()
                    .await
                    .map_err(Error::from)
            })
            .await
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(e) => e.code == 429 || e.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

async fn with_retry<T, F, Fut>(op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = kube::Result<T>>,
{
    let deadline = Instant::now() + RETRY_MAX_ELAPSED;
    let mut delay = RETRY_INITIAL_DELAY;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && Instant::now() + delay < deadline => {
                warn!(%op, %error, backoff_ms = delay.as_millis() as u64, "transient cluster error");
                sleep(delay).await;
                delay *= 2;
            }
            Err(error) => return Err(error.into()),
        }
    }
}
