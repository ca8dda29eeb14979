use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGER_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber. Later calls are no-ops.
///
/// `json` switches to machine-readable output (production); otherwise the
/// pretty formatter is used.
pub fn init_logger(service_name: &'static str, json: bool) {
    LOGGER_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let base = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_file(true)
            // Includes timing when the span closes
            .with_span_events(fmt::format::FmtSpan::CLOSE);

        let registry = tracing_subscriber::registry().with(filter);
        let installed = if json {
            registry.with(base.json()).try_init()
        } else {
            registry.with(base.pretty()).try_init()
        };

        // Another subscriber (e.g. a test harness) may already own the global slot.
        if installed.is_ok() {
            tracing::info!(service = service_name, "logger initialized");
        }
    });
}
