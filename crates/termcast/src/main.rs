use termcast_common::init_tracing;
use termcast_daemon::DaemonConfig;
use termcast_daemon::DaemonError;
use termcast_daemon::run_daemon;
use tracing::error;
use tracing::info;

fn main() {
    let _telemetry = init_tracing("info");
    if let Err(e) = run() {
        error!(error = %e, "termcast exited with an error");
        let code = match e.downcast_ref::<DaemonError>() {
            Some(DaemonError::InvalidListen { .. }) => 64, // EX_USAGE
            Some(DaemonError::SignalSetup(_)) => 71,       // EX_OSERR
            Some(_) => 74,                                 // EX_IOERR
            None => 1,
        };
        std::process::exit(code);
    }
}

fn run() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env();
    info!(
        listen = config.listen(),
        max_sessions = config.max_sessions(),
        max_connections = config.max_connections(),
        control_dir = %config.control_dir().display(),
        "Starting termcast"
    );
    run_daemon(config)?;
    Ok(())
}
