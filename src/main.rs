use std::sync::Arc;

use clinic_onboard::config::ServiceConfig;
use clinic_onboard::email::{CodeMailer, LogMailer, SmtpMailer};
use clinic_onboard::password::SaltedSha256;
use clinic_onboard::registration::routes::{RegistrationRouteState, registration_routes};
use clinic_onboard::registration::RegistrationEngine;
use clinic_onboard::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env()?;

    let db_path = std::path::Path::new(&config.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(db_path).await.unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
            std::process::exit(1);
        }),
    );

    let mailer: Arc<dyn CodeMailer> = match &config.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp.clone())),
        None => {
            tracing::warn!("No SMTP configured; verification codes are logged only");
            Arc::new(LogMailer)
        }
    };

    let engine = Arc::new(RegistrationEngine::new(
        db,
        mailer,
        Arc::new(SaltedSha256),
        config.registration_ttl_days,
    ));

    let app = registration_routes(RegistrationRouteState { engine });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, db = %config.db_path, "Clinic onboarding service started");
    axum::serve(listener, app).await?;

    Ok(())
}
