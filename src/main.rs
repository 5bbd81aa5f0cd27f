pub mod config;
pub mod mqtt;
pub mod session;
pub mod sync;
pub mod ui;

use color_eyre::Result;
use config::{BrokerCredentials, ConfigError, Settings};
use mqtt::config::MqttConfig;
use session::{mount_view, Session, ViewKind};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    match dotenvy::dotenv() {
        Ok(path) => info!("Loaded environment from {:?}", path),
        Err(e) if e.not_found() => {}
        Err(e) => error!("Failed to read .env file: {}", e),
    }

    let views = ViewKind::ALL;
    let session = open_session(&views);
    if let Err(e) = &session {
        error!("Configuration error: {}", e);
    }

    let mounted = views.iter().map(|kind| mount_view(&session, *kind)).collect();
    ui::run(mounted).await?;

    if let Ok(session) = session {
        session.shutdown().await;
    }
    info!("Goodbye");
    Ok(())
}

fn open_session(views: &[ViewKind]) -> Result<Session, ConfigError> {
    let settings = Settings::load()?;
    let credentials = BrokerCredentials::from_env()?;
    let config = MqttConfig::new(credentials, &settings)?;
    Ok(Session::open(config, &settings, views))
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    // Console output owns stdout.
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
