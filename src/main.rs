mod core;
mod utils;
mod workers;

use crate::utils::abort::AbortFlag;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Note: webrtc_ice generates many "unknown TransactionID" warnings for
    // late-arriving STUN responses, which are normal. Filter these out to
    // reduce noise.
    let filter = match args.verbose {
        0 => "warn,pastedrop=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    // Logs go to stderr; stdout is reserved for connection codes so they
    // can be piped.
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let abort = AbortFlag::new();

    // Ctrl+C handler
    let abort_clone = abort.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        abort_clone.abort();
    });

    workers::app::run(args, abort).await
}
