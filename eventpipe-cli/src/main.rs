//! Small end-to-end driver for the `eventpipe` pipeline: registers a
//! provider, enables a file-backed session against it, writes a
//! handful of synthetic events, then tears the session down and
//! prints the resulting metrics.

use clap::Parser;
use eventpipe::{
    EnableRequest, EventDef, Pipeline, Provider, ProviderConfig, SessionMode,
};
use eventpipe_wire::FormatVersion;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "eventpipe-cli")]
#[command(about = "Drives the eventpipe tracing pipeline end-to-end against a file sink")]
struct Args {
    /// Output trace file path.
    #[arg(long, value_name = "PATH", default_value = "./demo.nettrace")]
    output: std::path::PathBuf,

    /// Provider name to register and enable.
    #[arg(long, default_value = "Demo.Provider")]
    provider: String,

    /// Session keyword filter, as hex (e.g. "ff").
    #[arg(long, default_value = "ffffffffffffffff")]
    keywords: String,

    /// Session verbosity level (0 LogAlways .. 5 Verbose).
    #[arg(long, default_value_t = 5)]
    level: u8,

    /// Number of synthetic events to write.
    #[arg(long, default_value_t = 10)]
    count: u32,

    /// Circular buffer size per thread, in megabytes.
    #[arg(long, default_value_t = 1)]
    buffer_mb: usize,

    /// Delay between writes, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Request a rundown pass on disable.
    #[arg(long)]
    rundown: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let keywords = u64::from_str_radix(args.keywords.trim_start_matches("0x"), 16)
        .map_err(|e| anyhow::anyhow!("invalid --keywords '{}': {e}", args.keywords))?;

    let pipeline = Arc::new(Pipeline::new());
    pipeline.initialize()?;
    pipeline.finish_initialize();

    let provider = pipeline.register_provider(Provider::new(args.provider.clone()))?;
    let event = provider.add_event(EventDef::new(1, 0, args.level, keywords, false));

    let sink = eventpipe::file_sink(&args.output)?;
    let session_id = pipeline.enable_checked(EnableRequest {
        sink: Some(Box::new(sink)),
        mode: SessionMode::File { flush_interval: None },
        circular_buffer_mb: args.buffer_mb,
        format: FormatVersion::V4HeaderCompressed,
        rundown_requested: args.rundown,
        providers: vec![ProviderConfig {
            name: args.provider.clone(),
            keywords,
            level: args.level,
        }],
    })?;
    log::info!("session {session_id} enabled, writing to {}", args.output.display());

    for i in 0..args.count {
        let payload = i.to_le_bytes();
        pipeline.write_event(&args.provider, &event, &payload, None, None);
        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    pipeline.disable(session_id);

    let metrics = pipeline.metrics();
    println!(
        "wrote {} events ({} dropped, {} buffers allocated, {} stolen) to {}",
        metrics.events_written(),
        metrics.events_dropped(),
        metrics.buffers_allocated(),
        metrics.buffers_stolen(),
        args.output.display(),
    );

    Ok(())
}
