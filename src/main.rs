//! Command-line driver for the frame source.
//!
//! `run` simulates a sensor: producer threads allocate and publish frames, a
//! consumer drains them at its own pace, and a control thread keeps retuning
//! the queue size and swapping callback targets the way a host application
//! would. `print-config` renders the effective configuration.
//!
//! ```bash
//! cargo run --bin frame_source -- run --producers 4 --frames 500 --hold-ms 2
//! FRAMESRC_ARCHIVE__CAPACITY=4 cargo run --bin frame_source -- print-config
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use frame_source::config::DEFAULT_CONFIG_PATH;
use frame_source::{
    logging, Frame, FrameAdditionalData, FrameCallbackPtr, FrameHandle, FrameKind, FrameSource,
    MetadataParser, MetadataParserMap, Sensor, SourceConfig,
};
use tracing::{info, trace, warn};

#[derive(Parser, Debug)]
#[command(name = "frame_source", about = "Frame lifecycle driver for streaming sensors", version)]
struct Cli {
    /// Configuration file [default: config/frame_source.toml]; a missing
    /// file means defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream simulated frames through the source and report archive stats
    Run {
        /// Producer threads, alternating video and composite frames
        #[arg(long, default_value_t = 2)]
        producers: u32,

        /// Frames published by each producer
        #[arg(long, default_value_t = 200)]
        frames: u64,

        /// Payload size of video frames in bytes
        #[arg(long, default_value_t = 640 * 480)]
        frame_size: usize,

        /// How long the consumer holds each frame
        #[arg(long, default_value_t = 1)]
        hold_ms: u64,
    },
    /// Print the effective configuration as TOML
    PrintConfig,
}

/// Simulated camera owning the frame source.
struct SimulatedSensor;

impl Sensor for SimulatedSensor {
    fn name(&self) -> &str {
        "simulated"
    }
}

/// Reads a little-endian exposure value from the first raw metadata bytes.
struct ExposureParser;

impl MetadataParser for ExposureParser {
    fn parse(&self, frame: &Frame) -> Option<i64> {
        let raw = frame.additional().raw_metadata.get(..4)?;
        let bytes: [u8; 4] = raw.try_into().ok()?;
        Some(i64::from(u32::from_le_bytes(bytes)))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SourceConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SourceConfig::load().with_context(|| format!("loading {DEFAULT_CONFIG_PATH}"))?,
    };

    match cli.command {
        Command::PrintConfig => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Run {
            producers,
            frames,
            frame_size,
            hold_ms,
        } => {
            logging::init(&config.logging)?;
            run(&config, producers, frames, frame_size, Duration::from_millis(hold_ms))
        }
    }
}

fn run(
    config: &SourceConfig,
    producers: u32,
    frames: u64,
    frame_size: usize,
    hold: Duration,
) -> Result<()> {
    let sensor: Arc<dyn Sensor> = Arc::new(SimulatedSensor);
    let source = Arc::new(FrameSource::new(config));
    source.set_sensor(Arc::downgrade(&sensor));

    let mut parsers = MetadataParserMap::new();
    parsers.insert("exposure".to_string(), Arc::new(ExposureParser));
    source.init(Arc::new(parsers))?;

    let (tx, rx) = mpsc::sync_channel::<FrameHandle>(config.archive.capacity.max(1) as usize);
    let consumer = thread::Builder::new()
        .name("consumer".into())
        .spawn(move || {
            let mut consumed = 0u64;
            while let Ok(frame) = rx.recv() {
                if let Some(f) = frame.frame() {
                    trace!(
                        kind = f.kind().as_str(),
                        frame_number = f.frame_number(),
                        timestamp_ms = f.timestamp_ms(),
                        exposure = f.metadata("exposure"),
                        "Consumed frame"
                    );
                }
                thread::sleep(hold);
                consumed += 1;
                drop(frame);
            }
            consumed
        })?;

    let forwarding = forward_to(tx.clone());
    source.set_callback(Some(Arc::clone(&forwarding)));

    let done = Arc::new(AtomicBool::new(false));
    let control = {
        let source = Arc::clone(&source);
        let done = Arc::clone(&done);
        let forwarding = Arc::clone(&forwarding);
        thread::Builder::new().name("control".into()).spawn(move || {
            let option = source.get_published_size_option();
            let range = option.range();
            let mut round = 0u32;
            while !done.load(Ordering::Acquire) {
                let size = if round % 2 == 0 { range.default / 2.0 } else { range.default };
                if let Err(err) = option.set(size) {
                    warn!(error = %err, "Rejected queue size");
                }
                if round % 5 == 4 {
                    source.set_callback(None);
                }
                thread::sleep(Duration::from_millis(5));
                source.set_callback(Some(Arc::clone(&forwarding)));
                round += 1;
            }
        })?
    };

    let start = Instant::now();
    let workers = (0..producers)
        .map(|p| {
            let source = Arc::clone(&source);
            let kind = if p % 2 == 0 { FrameKind::Video } else { FrameKind::Composite };
            thread::Builder::new()
                .name(format!("producer-{p}"))
                .spawn(move || produce(&source, kind, p, frames, frame_size))
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))??;
    }
    done.store(true, Ordering::Release);
    control
        .join()
        .map_err(|_| anyhow!("control thread panicked"))?;

    source.set_callback(None);
    drop(forwarding);
    drop(tx);
    let consumed = consumer
        .join()
        .map_err(|_| anyhow!("consumer thread panicked"))?;

    source.flush();
    for kind in frame_source::SUPPORTED_KINDS {
        if let Some(stats) = source.stats(kind) {
            info!(
                kind = kind.as_str(),
                capacity = stats.capacity,
                live = stats.live,
                allocated = stats.allocated,
                recycled = stats.recycled,
                over_capacity = stats.over_capacity,
                "Archive summary"
            );
        }
    }
    let delivery = source.delivery_stats();
    info!(
        consumed,
        delivered = delivery.delivered,
        without_target = delivery.without_target,
        callback_faults = delivery.callback_faults,
        elapsed_ms = start.elapsed().as_millis(),
        "Run complete"
    );

    source.reset();
    Ok(())
}

/// Callback that hands frames to the consumer, dropping them when it lags.
fn forward_to(tx: SyncSender<FrameHandle>) -> FrameCallbackPtr {
    Arc::new(move |frame: FrameHandle| -> Result<()> {
        match tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("consumer hung up")),
        }
    })
}

fn produce(
    source: &FrameSource,
    kind: FrameKind,
    producer: u32,
    frames: u64,
    frame_size: usize,
) -> Result<()> {
    let (size, requires_memory) = match kind {
        FrameKind::Video => (frame_size, true),
        _ => (0, false),
    };

    for i in 0..frames {
        let exposure = 1000 + (i % 16) as u32;
        let additional = FrameAdditionalData {
            frame_number: i,
            timestamp_ms: i as f64 * 33.3,
            raw_metadata: exposure.to_le_bytes().to_vec(),
            ..Default::default()
        };

        let mut frame = source.alloc(kind, size, additional, requires_memory)?;
        if let Some(data) = frame.data_mut() {
            data.fill((producer as u8).wrapping_add(i as u8));
        }
        source.invoke_callback(frame);
    }
    Ok(())
}
