mod api;
mod webhook;

use std::sync::Arc;

use runboat_controller::controller::RunboatController;
use runboat_controller::metrics::Metrics;
use runboat_controller::settings::Settings;
use runboat_controller::telemetry;
use runboat_k8s_util::client::build_namespace_client;

use actix_web::{
    get, middleware, web, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

#[get("/metrics")]
async fn metrics(controller: Data<Arc<RunboatController>>, _req: HttpRequest) -> impl Responder {
    match controller.metrics.render() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="runboat",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,runboat=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. Tracing is disabled when
    /// not provided.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Ratio of traces to sample when tracing is enabled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format.clone(),
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    // configuration errors are fatal
    let settings = Settings::from_env()?;

    let mut registry = Registry::with_prefix("runboat");
    let config = Config::infer().await?;
    let client = build_namespace_client(config, &settings.build_namespace, &mut registry)?;
    let controller = RunboatController::new(settings, client, Metrics::new(registry))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let controller_loop = {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        async move { controller.run(shutdown).await }
    };

    let app_controller = controller.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(app_controller.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
            .service(
                web::scope("/api/v1")
                    .service(api::list_builds)
                    .service(api::get_build)
                    .service(api::deploy)
                    .service(api::start)
                    .service(api::stop)
                    .service(api::reset)
                    .service(api::undeploy)
                    .service(api::init_log)
                    .service(api::build_log)
                    .service(api::build_events)
                    .service(api::settings)
                    .service(webhook::github),
            )
    })
    .bind(("0.0.0.0", args.port))?
    .shutdown_timeout(10);

    // Both runtimes implement graceful shutdown, so poll until both are done
    let (_, served) = tokio::join!(controller_loop, server.run());
    served?;
    Ok(())
}
