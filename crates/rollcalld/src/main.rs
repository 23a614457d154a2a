use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod notifier;
mod registrar;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        roster_dir = %config.roster_dir.display(),
        export_dir = %config.export_dir.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    // Model loading and the initial roster scan block; keep them off the reactor.
    let engine_config = config.clone();
    let engine = tokio::task::spawn_blocking(move || engine::spawn_engine(&engine_config)).await??;
    let store = engine::roster_store(&config)?;

    let notifier = notifier::from_config(config.twilio.as_ref());
    let registrar = registrar::Registrar::new(&config, notifier);
    let service = dbus_interface::AttendanceService::new(
        engine,
        store,
        registrar,
        config.tolerance,
        config.twilio.is_some(),
    );

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, system = config.system_bus, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
