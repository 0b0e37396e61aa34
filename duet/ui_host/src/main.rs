use duet_ui_host_runtime::{ElementOperation, RendererSink, RuntimeConfig};
use std::io;
use std::process;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

/// Renderer stand-in: logs every replayed operation.
struct TraceSink;

impl RendererSink for TraceSink {
    fn apply(&mut self, op: &ElementOperation) -> Result<(), String> {
        debug!(op = op.name(), uid = op.uid(), "apply");
        Ok(())
    }
}

fn main() {
    // stdout carries frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DUET_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = RuntimeConfig::from_env();
    if let Err(err) = duet_ui_host_runtime::run(&config, io::stdin(), io::stdout(), |_| TraceSink)
    {
        error!("ui_host fatal error: {err}");
        process::exit(1);
    }
}
