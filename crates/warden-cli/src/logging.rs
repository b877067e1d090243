use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, filter, fmt};
use warden_execution::supervisor::ENGINE_LOG_TARGET;
use warden_execution::{EngineDiagnostic, EngineDiagnosticsLayer};

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warden=info",
        1 => "warden=debug",
        _ => "warden=trace",
    }
}

/// Installs the global subscriber. Logs go to stderr so stdout stays clean
/// for command output.
///
/// With `engine_output`, engine diagnostics are also forwarded to the
/// returned receiver regardless of the log level.
pub fn init(
    verbose: u8,
    json: bool,
    engine_output: bool,
) -> Option<mpsc::UnboundedReceiver<EngineDiagnostic>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let fmt_layer = if json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter)
            .boxed()
    };

    let (diagnostics_layer, receiver) = if engine_output {
        let (tx, rx) = mpsc::unbounded_channel();
        let layer = EngineDiagnosticsLayer::new(tx)
            .with_filter(filter::filter_fn(|meta| meta.target() == ENGINE_LOG_TARGET));
        (Some(layer), Some(rx))
    } else {
        (None, None)
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(diagnostics_layer)
        .try_init();
    receiver
}
