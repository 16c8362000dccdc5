use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize stdout structured logging.
///
/// Configuration is via the standard `RUST_LOG` environment variable
/// (default: `info`). The original's OpenTelemetry/OTLP export pipeline is
/// dropped here: metrics/trace export is out of scope, but the underlying
/// `tracing`/`tracing-subscriber` stack is kept exactly as the original uses
/// it for plain logging.
pub fn init_telemetry() -> Result<()> {
    let fmt_layer = fmt::layer().with_target(false).with_level(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default().with(filter).with(fmt_layer).init();

    Ok(())
}
