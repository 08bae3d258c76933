use std::fmt;
use std::sync::Arc;

use actix_web::http::header;
use actix_web::http::StatusCode;
use actix_web::{get, post, web, HttpRequest, HttpResponse, ResponseError};
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;

use runboat_controller::build::Build;
use runboat_controller::controller::RunboatController;
use runboat_controller::error::Error;
use runboat_controller::events::BuildEvent;

pub type Controller = web::Data<Arc<RunboatController>>;

/// Command errors mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    Command(Error),
    Unauthorized,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Command(e) => e.fmt(f),
            ApiError::Unauthorized => write!(f, "authentication required"),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Command(e)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Command(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Command(Error::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Command(Error::Rejected(_)) => StatusCode::BAD_REQUEST,
            ApiError::Command(Error::Unavailable) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Command(Error::Kube { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Command(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // template and serialization failures land in this bucket; the
            // response body alone does not tell them apart in the HTTP log
            if let ApiError::Command(e) = self {
                tracing::error!(kind = %e.metric_label(), error = %e, "internal error serving request");
            }
        }
        let mut builder = HttpResponse::build(status);
        if matches!(self, ApiError::Unauthorized) {
            builder.insert_header((header::WWW_AUTHENTICATE, "Basic realm=\"runboat\""));
        }
        builder.json(json!({ "detail": self.to_string() }))
    }
}

/// Validate the shared admin credential on mutating routes.
pub fn require_admin(req: &HttpRequest, controller: &RunboatController) -> Result<(), ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if check_basic_auth(
        header,
        &controller.settings.api_admin_user,
        &controller.settings.api_admin_password,
    ) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn check_basic_auth(header: Option<&str>, user: &str, password: &str) -> bool {
    let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    match credentials.split_once(':') {
        Some((u, p)) => u == user && p == password,
        None => false,
    }
}

/// A build as served by the API, with its deploy link attached.
#[derive(Serialize)]
struct BuildView {
    #[serde(flatten)]
    build: Build,
    link: String,
}

impl BuildView {
    fn new(build: Build, controller: &RunboatController) -> Self {
        let link = build.link(&controller.settings.build_domain);
        Self { build, link }
    }
}

#[derive(Deserialize)]
struct ListFilter {
    repo: Option<String>,
    target_branch: Option<String>,
    pr: Option<u64>,
}

#[get("/builds")]
pub async fn list_builds(
    controller: Controller,
    filter: web::Query<ListFilter>,
) -> Result<HttpResponse, ApiError> {
    let builds = controller
        .list_builds(
            filter.repo.as_deref(),
            filter.target_branch.as_deref(),
            filter.pr,
        )
        .await?;
    let views: Vec<BuildView> = builds
        .into_iter()
        .map(|b| BuildView::new(b, &controller))
        .collect();
    Ok(HttpResponse::Ok().json(views))
}

#[get("/builds/{name}")]
pub async fn get_build(
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let build = controller.get_build(&name).await?;
    Ok(HttpResponse::Ok().json(BuildView::new(build, &controller)))
}

#[derive(Deserialize)]
struct DeployRequest {
    repo: String,
    target_branch: String,
    pr: Option<u64>,
    git_commit: String,
}

#[post("/builds")]
pub async fn deploy(
    req: HttpRequest,
    controller: Controller,
    body: web::Json<DeployRequest>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&req, &controller)?;
    let name = controller
        .deploy(&body.repo, &body.target_branch, body.pr, &body.git_commit)
        .await?;
    Ok(HttpResponse::Accepted().json(json!({ "name": name })))
}

#[post("/builds/{name}/start")]
pub async fn start(
    req: HttpRequest,
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&req, &controller)?;
    controller.start(&name).await?;
    Ok(HttpResponse::Accepted().finish())
}

#[post("/builds/{name}/stop")]
pub async fn stop(
    req: HttpRequest,
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&req, &controller)?;
    controller.stop(&name).await?;
    Ok(HttpResponse::Accepted().finish())
}

#[post("/builds/{name}/reset")]
pub async fn reset(
    req: HttpRequest,
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&req, &controller)?;
    controller.reset(&name).await?;
    Ok(HttpResponse::Accepted().finish())
}

#[post("/builds/{name}/undeploy")]
pub async fn undeploy(
    req: HttpRequest,
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_admin(&req, &controller)?;
    controller.undeploy(&name).await?;
    Ok(HttpResponse::Accepted().finish())
}

#[get("/builds/{name}/init-log")]
pub async fn init_log(
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let log = controller.init_log(&name).await?;
    Ok(HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(log))
}

#[get("/builds/{name}/log")]
pub async fn build_log(
    controller: Controller,
    name: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let log = controller.build_log(&name).await?;
    Ok(HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(log))
}

/// One SSE event per build index delta. A fresh subscriber first receives
/// the full current snapshot as `upd` events; a subscriber that falls too
/// far behind is disconnected and reconnects for a new snapshot.
#[get("/build-events")]
pub async fn build_events(controller: Controller) -> Result<HttpResponse, ApiError> {
    // subscribe before snapshotting: duplicated updates are harmless,
    // missed ones are not
    let deltas = controller.index.bus().subscribe();
    let snapshot = controller.index.snapshot().await?;

    let initial = futures::stream::iter(
        snapshot
            .into_iter()
            .map(|build| sse_chunk(&BuildEvent::Upd(build))),
    );
    let live = BroadcastStream::new(deltas)
        .take_while(|event| futures::future::ready(event.is_ok()))
        .filter_map(|event| async move { event.ok() })
        .map(|event| sse_chunk(&event));

    let body = initial.chain(live).map(Ok::<_, actix_web::Error>);
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(body))
}

fn sse_chunk(event: &BuildEvent) -> web::Bytes {
    let payload = serde_json::to_string(event).unwrap_or_default();
    web::Bytes::from(format!("data: {payload}\n\n"))
}

/// Presentation settings for an external front-end.
#[get("/settings")]
pub async fn settings(controller: Controller) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "base_url": controller.settings.base_url,
        "build_domain": controller.settings.build_domain,
        "additional_footer_html": controller.settings.additional_footer_html,
    }))
}
