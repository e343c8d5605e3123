use actix_cors::Cors;
use actix_web::middleware::{Compress, NormalizePath};
use actix_web::{web, App, HttpServer};

mod error;
mod identity;
mod models;
mod repo;
mod routes;

use error::{json_error_handler, path_error_handler, query_error_handler};
use identity::{IdentityProvider, StubIdentity};
use repo::build_repo;
use routes::{config, AppState};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables are set externally (shell, systemd, Docker, ...).
    // Load .env automatically only in debug builds to reduce setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping RSD server");

    let repo = build_repo().await;
    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    info!("Using in-memory repository backend");
    #[cfg(feature = "postgres-store")]
    info!("Using Postgres repository backend");

    let stub = StubIdentity::from_env();
    let caller = stub.resolve();
    info!("Stub identity: {} ({:?})", caller.username, caller.role);
    let identity = Arc::new(stub);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let state = AppState { repo, identity };

    let server = HttpServer::new(move || {
        // Development-only CORS: any origin. Restrict before production use.
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_header()
            .allowed_methods(["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
            .max_age(3600);

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(NormalizePath::trim())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .app_data(web::PathConfig::default().error_handler(path_error_handler))
            .configure(config)
    })
    .bind(("0.0.0.0", port))?;

    info!("Listening on http://0.0.0.0:{port}");

    server.run().await
}
