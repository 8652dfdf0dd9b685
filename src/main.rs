use anyhow::{bail, Context};
use clap::Parser;
use eudebug::backend::replay::ReplayFactory;
use eudebug::backend::BackendRegistry;
use eudebug::config::Config;
use eudebug::device::StaticDevice;
use eudebug::session::error::Error;
use eudebug::session::event::DebugEventKind;
use eudebug::session::DebugSession;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Attach to a GPU workload and print its debug events.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Process id of the GPU workload.
    #[arg(long, env = "EUDBG_PID")]
    pid: u32,

    /// TOML file with `[session]` and `[device]` tables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replay a JSON lines trace instead of a kernel debug connection.
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Wait for a single event, in milliseconds.
    #[arg(long, default_value_t = 500)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("load configuration {}", path.display()))?,
        None => Config::default(),
    };
    config.session.pid = args.pid;

    let mut registry = BackendRegistry::with_defaults();
    if let Some(trace) = &args.trace {
        registry.register(Box::new(ReplayFactory::from_file(trace)?));
        config.device.driver = Some("replay".to_string());
    }

    let device = Arc::new(StaticDevice::from_config(&config.device)?);
    let session = DebugSession::attach(&registry, device, config.session)
        .with_context(|| format!("attach to pid {}", args.pid))?;
    println!("attached to pid {}", args.pid);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))?;
    }

    let timeout = Duration::from_millis(args.timeout);
    while !stop.load(Ordering::SeqCst) {
        let event = match session.read_event(timeout) {
            Ok(event) => event,
            Err(Error::NotReady) => continue,
            Err(e) if e.is_fatal() => bail!(e),
            Err(e) => {
                eprintln!("read event: {e}");
                continue;
            }
        };
        println!("{event}");

        if event.need_ack {
            if let Err(e) = session.acknowledge_event(&event) {
                eprintln!("acknowledge: {e}");
            }
        }
        if matches!(event.kind, DebugEventKind::Detached { .. }) {
            break;
        }
    }

    drop(session);
    println!("detached from pid {}", args.pid);
    Ok(())
}
