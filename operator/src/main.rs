use clap::Parser;
use controller::{Error, Manager, Result, config::Config};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware,
    web::Data,
};

#[get("/metrics")]
async fn metrics(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Setup tracing layers
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::Other(format!("invalid log filter: {e}")))?;
    let collector = Registry::default()
        .with(config.log_json.then(|| fmt::layer().json()))
        .with((!config.log_json).then(fmt::layer))
        .with(env_filter);

    // Initialize tracing
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| Error::Other(format!("cannot install the tracing subscriber: {e}")))?;

    // Start kubernetes controllers
    let bind = config.bind.clone();
    let (manager, controllers) = Manager::new(config).await?;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&bind)
    .map_err(|e| Error::Other(format!("Can not bind to {bind}: {e}")))?
    .shutdown_timeout(5);

    tokio::select! {
        _ = controllers.hub => tracing::warn!("LynqHub controller exited"),
        _ = controllers.form => tracing::warn!("LynqForm controller exited"),
        _ = controllers.node => tracing::warn!("LynqNode controller exited"),
        _ = controllers.status => tracing::warn!("Status flusher exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
    Ok(())
}
