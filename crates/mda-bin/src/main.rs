//! `mda-stream` command line.
//!
//! - `produce`: run a simulated acquisition into a file-backed frame store
//!   and forward its notifications to a listener
//! - `listen`: accept one producer, mirror its store, print every event and
//!   optionally save the finished acquisition
//! - `inspect`: print the header of a ring buffer file
//! - `show-config`: print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! mda-stream listen --endpoint unix:/tmp/mda.sock --store /dev/shm/mda.buf --save out/
//! mda-stream produce --endpoint unix:/tmp/mda.sock --store /dev/shm/mda.buf --channels 2 --frames 10
//! ```

mod logging;
mod simulate;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mda_bus::{Endpoint, RemoteForwarder, RemoteReceiver};
use mda_consumers::{DisplayCache, FrameSaver, OverflowPolicy, RemoteMirror};
use mda_core::{FrameSource, SequenceContext, SequenceDescriptor, StreamConfig};
use mda_storage::{FrameStore, RingBufferReader};
use simulate::SimulatedCamera;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mda-stream")]
#[command(about = "Buffered multi-dimensional frame store with cross-process notifications", long_about = None)]
struct Cli {
    /// TOML configuration file (MDA_* environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated acquisition and forward its notifications
    Produce {
        /// Where the listener is bound (unix:<path> or tcp:<host:port>)
        #[arg(long)]
        endpoint: Option<String>,

        /// Ring buffer backing file
        #[arg(long)]
        store: Option<PathBuf>,

        /// Ring buffer capacity in bytes
        #[arg(long)]
        capacity_bytes: Option<u64>,

        #[arg(long, default_value_t = 1)]
        channels: u32,

        #[arg(long, default_value_t = 1)]
        slices: u32,

        /// Time points
        #[arg(long, default_value_t = 10)]
        frames: u32,

        #[arg(long, default_value_t = 512)]
        width: u32,

        #[arg(long, default_value_t = 512)]
        height: u32,

        /// Pause between frames
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Accept one producer and mirror its store
    Listen {
        #[arg(long)]
        endpoint: Option<String>,

        /// Producer's ring buffer backing file
        #[arg(long)]
        store: Option<PathBuf>,

        /// Write the finished acquisition into this directory
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Print a ring buffer file's header
    Inspect { path: PathBuf },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = StreamConfig::load_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    let tracing_config =
        logging::TracingConfig::from_logging_config(&config.logging).map_err(anyhow::Error::msg)?;
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Produce {
            endpoint,
            store,
            capacity_bytes,
            channels,
            slices,
            frames,
            width,
            height,
            interval_ms,
        } => {
            if let Some(path) = store {
                config.store.backing_path = Some(path);
            }
            if let Some(capacity) = capacity_bytes {
                config.store.capacity_bytes = capacity;
            }
            let endpoint = resolve_endpoint(endpoint, &config)?;
            let camera = SimulatedCamera::new(
                SequenceDescriptor::new(channels, slices, frames),
                width,
                height,
                config.store.pixel_type,
            )
            .with_interval(Duration::from_millis(interval_ms));
            produce(&config, &endpoint, camera).await
        }
        Commands::Listen {
            endpoint,
            store,
            save,
        } => {
            let endpoint = resolve_endpoint(endpoint, &config)?;
            let Some(store) = store.or_else(|| config.store.backing_path.clone()) else {
                bail!("listen needs the producer's backing file (--store or store.backing_path)");
            };
            listen(&config, &endpoint, &store, save.as_deref()).await
        }
        Commands::Inspect { path } => inspect(&path),
        Commands::ShowConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn resolve_endpoint(cli: Option<String>, config: &StreamConfig) -> Result<Endpoint> {
    let Some(endpoint) = cli.or_else(|| config.channel.endpoint.clone()) else {
        bail!("no endpoint given (--endpoint or channel.endpoint)");
    };
    Ok(endpoint.parse()?)
}

async fn produce(
    config: &StreamConfig,
    endpoint: &Endpoint,
    mut camera: SimulatedCamera,
) -> Result<()> {
    if config.store.backing_path.is_none() {
        bail!("produce needs a backing file (--store or store.backing_path) so the listener can map it");
    }

    let context = SequenceContext::new();
    let store = Arc::new(FrameStore::from_config(config)?.with_context(context.clone()));
    let forwarder = Arc::new(
        RemoteForwarder::connect(endpoint, &config.channel)
            .await
            .with_context(|| format!("Failed to connect to {endpoint}"))?,
    );
    forwarder.attach(store.events());

    // the camera blocks between frames, keep it off the runtime's workers
    let sink = Arc::clone(&store);
    let acquisition = tokio::task::spawn_blocking(move || {
        let result = camera.run(sink.as_ref());
        (result, camera.skipped())
    })
    .await
    .context("Acquisition task panicked")?;

    // the listener is told to stop even when the acquisition failed
    let stopped = forwarder.send_stop().await;
    let (result, skipped) = acquisition;
    result?;
    stopped?;

    let stats = store.stats();
    let declared = context.current().map(|d| d.frame_count()).unwrap_or_default();
    store.close();
    println!(
        "produced {} frames of {} declared ({} bytes, {} wraps, {} duplicates, {} skipped)",
        stats.frames_written, declared, stats.bytes_written, stats.wraps, stats.duplicates, skipped
    );
    Ok(())
}

async fn listen(
    config: &StreamConfig,
    endpoint: &Endpoint,
    store: &Path,
    save: Option<&Path>,
) -> Result<()> {
    let listener = endpoint.bind().await?;
    let transport = listener.accept().await?;

    let receiver = RemoteReceiver::new(&config.channel);
    let mirror = Arc::new(RemoteMirror::new(
        store,
        config.store.pixel_type,
        &config.index,
    )?);
    mirror.attach(&receiver);

    let display = Arc::new(DisplayCache::new(mirror.clone(), OverflowPolicy::Grow));
    display.attach(mirror.as_ref());
    let saver = Arc::new(FrameSaver::new(mirror.clone(), mirror.context().clone()));
    saver.attach(mirror.as_ref());

    mirror.events().on_sequence_started(|descriptor| {
        println!(
            "sequence_started c={} z={} t={} p={} g={}",
            descriptor.c, descriptor.z, descriptor.t, descriptor.p, descriptor.g
        );
    });
    let cache = Arc::clone(&display);
    display.on_frame_cached(move |coordinate| {
        let mean = cache.frame(coordinate).map(|f| f.mean()).unwrap_or_default();
        println!("frame_ready {coordinate} mean={mean:.1}");
    });

    receiver.start(transport)?;
    receiver.join().await;

    let stats = receiver.stats();
    println!(
        "received {} events ({} malformed), exit {:?}",
        stats.dispatched,
        stats.malformed,
        receiver.exit_reason()
    );
    if display.failures() > 0 || mirror.failures() > 0 {
        let display_failures = display.failures();
        let mirror_failures = mirror.failures();
        tracing::warn!(
            display = display_failures,
            mirror = mirror_failures,
            "Some frames could not be mirrored"
        );
    }

    if let Some(dir) = save {
        let path = saver.save_raw(dir)?;
        println!("saved {}", path.display());
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let reader = RingBufferReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    println!("path        {}", reader.path().display());
    println!("capacity    {}", reader.capacity());
    println!("pixel_type  {}", reader.pixel_type());
    println!("write_head  {}", reader.write_head());
    println!("wraps       {}", reader.wraps());
    println!("stream_id   {:#018x}", reader.stream_id());
    Ok(())
}
