use crate::url::{resource_kind, template_path};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FutureExt;
use http::{Method, Request};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family, histogram::Histogram};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;
use tower::{Layer, Service};

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ApiCallLabels {
    pub verb: String,
    pub resource: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ApiResultLabels {
    pub verb: String,
    pub resource: String,
    pub status: String,
}

/// Tower layer breaking the controller's apiserver traffic down by verb
/// and resource kind, so the load it puts on deployments, jobs and pods
/// can be told apart from the metrics alone. Transport failures are
/// counted under `status="error"`.
pub struct InstrumentLayer {
    duration: Family<ApiCallLabels, Histogram>,
    calls: Family<ApiResultLabels, Counter>,
}

impl InstrumentLayer {
    pub fn new(registry: &mut Registry) -> Self {
        let duration = Family::<ApiCallLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.05, 0.1, 0.25, 0.5, 1., 2.5, 5.].into_iter())
        });
        let calls = Family::<ApiResultLabels, Counter>::default();

        registry.register_with_unit(
            "kubernetes_api_call_duration",
            "Latencies of apiserver calls by verb and resource",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "kubernetes_api_calls",
            "Apiserver calls by verb, resource and response status",
            calls.clone(),
        );

        Self { duration, calls }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentedClient<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentedClient {
            inner,
            duration: self.duration.clone(),
            calls: self.calls.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentedClient<S> {
    inner: S,
    duration: Family<ApiCallLabels, Histogram>,
    calls: Family<ApiResultLabels, Counter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InstrumentedClient<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let path = req.uri().path();
        let verb = verb_of(req.method(), path, req.uri().query()).to_string();
        let resource = resource_kind(path);

        let start_time = Instant::now();
        let fut = self.inner.call(req);
        let duration = self.duration.clone();
        let calls = self.calls.clone();
        async move {
            let result = fut.await;
            duration
                .get_or_create(&ApiCallLabels {
                    verb: verb.clone(),
                    resource: resource.clone(),
                })
                .observe(start_time.elapsed().as_secs_f64());
            let status = match &result {
                Ok(response) => response.status().as_u16().to_string(),
                Err(_) => "error".to_string(),
            };
            calls
                .get_or_create(&ApiResultLabels {
                    verb,
                    resource,
                    status,
                })
                .inc();
            result
        }
        .boxed()
    }
}

/// Kubernetes verb of a request, in apiserver audit-log terms.
fn verb_of(method: &Method, path: &str, query: Option<&str>) -> &'static str {
    let named = template_path(path).contains("{name}");
    let watch = query.map_or(false, |q| q.contains("watch=true"));
    match (method.as_str(), named) {
        ("GET", _) if watch => "watch",
        ("GET", true) => "get",
        ("GET", false) => "list",
        ("POST", _) => "create",
        ("PUT", _) => "update",
        ("PATCH", _) => "patch",
        ("DELETE", true) => "delete",
        ("DELETE", false) => "deletecollection",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = "/apis/apps/v1/namespaces/ns/deployments/b1";
    const JOBS: &str = "/apis/batch/v1/namespaces/ns/jobs";

    #[test]
    fn reads_and_lists() {
        assert_eq!(verb_of(&Method::GET, DEPLOYMENT, None), "get");
        assert_eq!(verb_of(&Method::GET, JOBS, Some("labelSelector=x")), "list");
    }

    #[test]
    fn watches_are_told_apart_from_lists() {
        assert_eq!(
            verb_of(&Method::GET, JOBS, Some("watch=true&labelSelector=x")),
            "watch"
        );
    }

    #[test]
    fn writes() {
        assert_eq!(verb_of(&Method::PATCH, DEPLOYMENT, None), "patch");
        assert_eq!(verb_of(&Method::POST, JOBS, None), "create");
        assert_eq!(verb_of(&Method::DELETE, DEPLOYMENT, None), "delete");
        assert_eq!(verb_of(&Method::DELETE, JOBS, None), "deletecollection");
    }
}
