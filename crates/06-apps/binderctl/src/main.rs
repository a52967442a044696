//! Command-line driver for the IPC engine and the frame queues.
//!
//! Every command runs against in-process peers: IPC calls go to a scripted
//! binder driver and frames go to a recording compositor.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use binder_ipc::{ProcessContext, ProcessIdentity, ScriptedDriver, TransactStatus};
use binder_wire::protocol::TF_ONE_WAY;
use binder_wire::{Command as DriverCommand, Parcel, Return, TransactionData};
use blast_queue::{BlastBufferQueue, RecordingComposer, SurfaceControl};
use buffer_queue::{
    create_buffer_queue, Api, BufferItem, ConsumerListener, Fence, ProducerListener, QueueBufferInput,
    PIXEL_FORMAT_RGBA_8888,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::CliConfig;

/// Text rendering helpers used by the commands.
mod render {
    use binder_ipc::{FrozenInfo, TransactStatus};

    pub fn transact(handle: u32, code: u32, status: TransactStatus, reply: Option<i32>) -> String {
        match (status, reply) {
            (TransactStatus::PendingFrozen, _) => {
                format!("handle {handle} code {code}: queued for a frozen receiver")
            }
            (TransactStatus::Completed, Some(value)) => format!("handle {handle} code {code}: reply {value}"),
            (TransactStatus::Completed, None) => format!("handle {handle} code {code}: sent one-way"),
        }
    }

    pub fn frozen(pid: i32, frozen: bool, info: FrozenInfo) -> String {
        format!(
            "pid {pid}: frozen={} sync_received={} async_received={}",
            frozen as u8, info.sync_received, info.async_received
        )
    }

    pub fn pool(max_threads: usize, max_total: usize, started: bool, next_name: &str) -> String {
        format!("pool: started={} max_threads={max_threads} max_total={max_total} next={next_name}", started as u8)
    }

    pub fn presented(frame: u64, on_screen: Option<u64>, releases: usize) -> String {
        match on_screen {
            Some(current) => format!("frame {frame}: on screen={current} releases={releases}"),
            None => format!("frame {frame}: nothing on screen releases={releases}"),
        }
    }
}

/// Exercise the binder engine and the frame queues in-process.
#[derive(Parser, Debug)]
#[command(author, version, about = "Drive the binder engine and frame queues", long_about = None)]
struct Cli {
    /// TOML file with `[ipc]`, `[queue]` and `[blast]` tables.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration.
    Config,
    /// Send one transaction carrying an i32 to a scripted peer that doubles it.
    Transact {
        /// Target handle.
        #[arg(long, default_value_t = 0)]
        handle: u32,
        /// Transaction code.
        #[arg(long, default_value_t = 1, value_parser = parse_u32)]
        code: u32,
        /// Payload.
        #[arg(default_value_t = 21, allow_negative_numbers = true)]
        value: i32,
        /// Do not wait for a reply.
        #[arg(long)]
        one_way: bool,
        /// How the peer behaves.
        #[arg(long, value_enum, default_value_t = PeerArg::Alive)]
        peer: PeerArg,
    },
    /// Start the thread pool and report its limits.
    Pool {
        /// Overrides `ipc.max_threads`.
        #[arg(long)]
        max_threads: Option<usize>,
        /// Mark the pool started and spawn its main thread.
        #[arg(long)]
        start: bool,
    },
    /// Freeze or thaw a process, then show its pending work.
    Freeze {
        pid: i32,
        /// Thaw instead of freezing.
        #[arg(long)]
        thaw: bool,
        #[arg(long, default_value_t = 100)]
        timeout_ms: u32,
    },
    /// Push frames through a buffer queue and dump its slots.
    Queue {
        #[arg(long, default_value_t = 3)]
        frames: u32,
        #[arg(long, default_value_t = 64)]
        width: u32,
        #[arg(long, default_value_t = 64)]
        height: u32,
    },
    /// Push frames through a transaction-based queue to a recording compositor.
    Blast {
        #[arg(long, default_value_t = 3)]
        frames: u32,
        #[arg(long, default_value_t = 64)]
        width: u32,
        #[arg(long, default_value_t = 64)]
        height: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PeerArg {
    /// Answers every call.
    Alive,
    /// Replies that the target died.
    Dead,
    /// Queues one-way calls and refuses the rest as frozen.
    Frozen,
}

const OWN_PID: i32 = 1000;
const OWN_UID: u32 = 1000;

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref())?;
    debug!(?config, "effective config");

    match cli.command {
        Command::Config => println!("{config:#?}"),
        Command::Transact {
            handle,
            code,
            value,
            one_way,
            peer,
        } => handle_transact(&config, handle, code, value, one_way, peer)?,
        Command::Pool { max_threads, start } => handle_pool(&config, max_threads, start)?,
        Command::Freeze { pid, thaw, timeout_ms } => handle_freeze(&config, pid, !thaw, timeout_ms)?,
        Command::Queue { frames, width, height } => handle_queue(&config, frames, width, height)?,
        Command::Blast { frames, width, height } => handle_blast(&config, frames, width, height)?,
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(env_filter).with_writer(std::io::stderr).try_init();
}

fn scripted_context(config: &CliConfig, driver: &Arc<ScriptedDriver>) -> Result<ProcessContext> {
    let driver: Arc<dyn binder_ipc::Driver> = driver.clone();
    ProcessContext::init(driver, config.ipc.clone()).context("failed to open the binder driver")
}

fn scripted_driver() -> ScriptedDriver {
    ScriptedDriver::new().with_identity(ProcessIdentity {
        pid: OWN_PID,
        uid: OWN_UID,
    })
}

/// What the scripted peer answers to one outgoing call.
fn peer_answer(peer: PeerArg, tr: &TransactionData) -> Vec<Return> {
    match peer {
        PeerArg::Dead => vec![Return::DeadReply],
        PeerArg::Frozen if tr.is_one_way() => vec![Return::TransactionPendingFrozen],
        PeerArg::Frozen => vec![Return::FrozenReply],
        PeerArg::Alive if tr.is_one_way() => vec![Return::TransactionComplete],
        PeerArg::Alive => {
            let value = Parcel::from_bytes(&tr.data).read_i32().unwrap_or_default();
            let mut reply = Parcel::new();
            let data = match reply.write_i32(value.wrapping_mul(2)) {
                Ok(()) => reply.data().to_vec(),
                Err(_) => return vec![Return::FailedReply],
            };
            vec![
                Return::TransactionComplete,
                Return::Reply(TransactionData {
                    data,
                    buffer_id: 1,
                    ..TransactionData::default()
                }),
            ]
        }
    }
}

fn handle_transact(config: &CliConfig, handle: u32, code: u32, value: i32, one_way: bool, peer: PeerArg) -> Result<()> {
    let driver = Arc::new(scripted_driver());
    driver.set_responder(move |cmd: &DriverCommand| match cmd {
        DriverCommand::Transaction(tr) => peer_answer(peer, tr),
        _ => Vec::new(),
    });
    let ctx = scripted_context(config, &driver)?;

    let mut data = Parcel::new();
    data.write_i32(value).context("failed to write the payload")?;
    let flags = if one_way { TF_ONE_WAY } else { 0 };
    let mut reply = Parcel::new();
    let status = if one_way {
        ctx.transact(handle, code, &data, None, flags)
    } else {
        ctx.transact(handle, code, &data, Some(&mut reply), flags)
    }
    .with_context(|| format!("transaction to handle {handle} failed"))?;

    let answer = match status {
        TransactStatus::Completed if !one_way => Some(reply.read_i32().context("malformed reply")?),
        _ => None,
    };
    println!("{}", render::transact(handle, code, status, answer));
    info!(round_trips = driver.round_trips(), "transact done");
    ctx.shutdown();
    Ok(())
}

fn handle_pool(config: &CliConfig, max_threads: Option<usize>, start: bool) -> Result<()> {
    let driver = Arc::new(scripted_driver());
    let ctx = scripted_context(config, &driver)?;
    if let Some(max_threads) = max_threads {
        ctx.set_thread_pool_max_thread_count(max_threads)
            .with_context(|| format!("failed to set max threads to {max_threads}"))?;
    }
    if start {
        ctx.start_thread_pool();
    }
    let next = ctx.make_thread_name();
    println!(
        "{}",
        render::pool(
            ctx.pool().max_threads(),
            ctx.thread_pool_max_total_thread_count(),
            ctx.is_thread_pool_started(),
            &next,
        )
    );
    // Closing the peer sends every pooled thread home.
    driver.close();
    ctx.shutdown();
    Ok(())
}

fn handle_freeze(config: &CliConfig, pid: i32, enable: bool, timeout_ms: u32) -> Result<()> {
    let driver = Arc::new(scripted_driver());
    let ctx = scripted_context(config, &driver)?;
    ctx.freeze(pid, enable, timeout_ms)
        .with_context(|| format!("failed to change frozen state of pid {pid}"))?;
    let info = ctx
        .frozen_info(pid)
        .with_context(|| format!("failed to read frozen info of pid {pid}"))?;
    println!("{}", render::frozen(pid, driver.is_frozen(pid), info));
    ctx.shutdown();
    Ok(())
}

struct Quiet;

impl ConsumerListener for Quiet {
    fn on_frame_available(&self, item: &BufferItem) {
        debug!(frame = item.frame_number, slot = item.slot, "frame available");
    }
}

fn handle_queue(config: &CliConfig, frames: u32, width: u32, height: u32) -> Result<()> {
    let (producer, consumer) = create_buffer_queue(&config.queue).context("failed to create the buffer queue")?;
    consumer.connect(Arc::new(Quiet), false)?;
    producer.connect(None, Api::Cpu, false)?;

    for frame in 0..frames {
        let out = producer.dequeue_buffer(width, height, 0, 0).context("dequeue failed")?;
        producer.request_buffer(out.slot)?;
        producer.queue_buffer(out.slot, QueueBufferInput::new(i64::from(frame), Fence::NO_FENCE))?;
        let Some(item) = consumer.acquire_buffer(0, 0)?.into_item() else {
            bail!("frame {frame} was queued but could not be acquired");
        };
        // Hold on to the last one so the dump shows an acquired slot.
        if frame + 1 < frames {
            consumer.release_buffer(item.slot, item.frame_number, Fence::NO_FENCE)?;
        }
    }
    print!("{}", consumer.dump_state());
    producer.disconnect(Api::Cpu)?;
    Ok(())
}

#[derive(Default)]
struct ReleaseCounter(AtomicUsize);

impl ProducerListener for ReleaseCounter {
    fn on_buffer_released(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn handle_blast(config: &CliConfig, frames: u32, width: u32, height: u32) -> Result<()> {
    let composer = Arc::new(RecordingComposer::new());
    let bbq = BlastBufferQueue::new(&config.blast, composer.clone()).context("failed to create the queue")?;
    let surface = SurfaceControl::new(1);
    bbq.update(&surface, width, height, PIXEL_FORMAT_RGBA_8888)?;

    let producer = bbq.producer();
    let releases = Arc::new(ReleaseCounter::default());
    producer.connect(Some(releases.clone()), Api::Egl, false)?;

    for _ in 0..frames {
        let out = producer.dequeue_buffer(width, height, 0, 0).context("dequeue failed")?;
        producer.request_buffer(out.slot)?;
        producer.queue_buffer(out.slot, QueueBufferInput::default())?;
        while let Some(applied) = composer.try_next() {
            composer.present(applied.transaction);
        }
        println!(
            "{}",
            render::presented(
                bbq.last_acquired_frame_number(),
                composer.current_frame(surface.id()),
                releases.0.load(Ordering::SeqCst),
            )
        );
    }
    producer.disconnect(Api::Egl)?;
    Ok(())
}

fn parse_u32(input: &str) -> Result<u32, String> {
    if let Some(stripped) = input.strip_prefix("0x") {
        u32::from_str_radix(stripped, 16).map_err(|_| format!("invalid hex value '{input}'"))
    } else {
        input.parse::<u32>().map_err(|_| format!("invalid number '{input}'"))
    }
}
