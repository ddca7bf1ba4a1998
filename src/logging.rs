use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DOSSIER_LOG";
pub const DEFAULT_FILTER: &str = "dossier=info,sqlx=warn";

fn filter() -> EnvFilter {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the JSON subscriber on stderr so stdout stays free for
/// reports, and forwards `log` records into it. Later calls are no-ops.
pub fn init_logging() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        let _ = tracing_log::LogTracer::init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!(target: "dossier", event = "logging_test");
    }
}
