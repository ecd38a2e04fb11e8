use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use libloading::Library;
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use tether_runtime::{
    create_channel_stream, NativeStream, ProduceError, SessionSummary, SupervisorConfig,
    TetherCHandle, WorkerContext, WorkerExit,
};

/// 已加载的原生库；原生线程可能在 init 返回后继续运行，库不能提前卸载
static LOADED_LIBS: Lazy<Mutex<HashMap<PathBuf, Library>>> = Lazy::new(|| Mutex::new(HashMap::new()));

type InitFn = unsafe extern "C" fn(*mut TetherCHandle);

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Cross-boundary streaming handle demo")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a supervised stream with Rust workers
    Run(RunArgs),
    /// Load a native library and hand it a stream handle
    Native {
        /// Shared library path
        library: PathBuf,
        /// Entry point taking a `TetherCHandle *`
        #[arg(long, default_value = "init")]
        symbol: String,
        /// Stop after receiving this many items
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Channel capacity (0 = unbounded)
        #[arg(long, default_value_t = 0)]
        capacity: usize,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Number of worker threads
    #[arg(short, long, default_value_t = 2)]
    workers: usize,
    /// Stop after receiving this many items
    #[arg(short, long, default_value_t = 10)]
    limit: usize,
    /// How the session ends once the limit is reached
    #[arg(long, value_enum, default_value_t = StopMode::Cancel)]
    stop: StopMode,
    /// Delay before a worker starts producing
    #[arg(long, default_value_t = 5)]
    warmup_ms: u64,
    /// Delay between pushes
    #[arg(long, default_value_t = 50)]
    pacing_us: u64,
    /// Channel capacity (0 = unbounded)
    #[arg(long, default_value_t = 0)]
    capacity: usize,
    /// Make every worker fail after producing this many items
    #[arg(long)]
    fail_after: Option<u64>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            workers: 2,
            limit: 10,
            stop: StopMode::Cancel,
            warmup_ms: 5,
            pacing_us: 50,
            capacity: 0,
            fail_after: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum StopMode {
    /// Cancel from the consumer side
    Cancel,
    /// Mark the session complete
    Complete,
}

fn main() -> miette::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(args)) => run_stream(&args)?,
        Some(Commands::Native {
            library,
            symbol,
            limit,
            capacity,
        }) => run_native(&library, &symbol, limit, capacity)?,
        None => run_stream(&RunArgs::default())?,
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("TETHER_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn run_stream(args: &RunArgs) -> miette::Result<()> {
    let config = SupervisorConfig::new(args.workers)
        .with_warmup(Duration::from_millis(args.warmup_ms))
        .with_pacing(Duration::from_micros(args.pacing_us))
        .with_channel_capacity(args.capacity);
    let fail_after = args.fail_after;

    let session = create_channel_stream(config, move |ctx: &mut WorkerContext| {
        if fail_after.is_some_and(|n| ctx.sequence() >= n) {
            return Err(ProduceError::new(format!("worker {} reached its failure point", ctx.id())));
        }
        let name = thread::current().name().unwrap_or("worker").to_string();
        Ok(format!("This is a string from {}: Worker {}, Count {}", name, ctx.id(), ctx.sequence() + 1))
    })
    .map_err(|e| miette::miette!("Failed to create stream: {}", e))?;

    session.supervisor.on_closed(|summary| {
        println!("[tether] stream closed: {:?}, {} items pushed", summary.reason, summary.pushed);
    });
    session
        .start()
        .map_err(|e| miette::miette!("Failed to start stream: {}", e))?;
    println!("[tether] started {} workers", args.workers);
    tracing::info!(workers = args.workers, limit = args.limit, stop = ?args.stop, "stream started");

    let mut received = 0;
    for item in session.items.iter() {
        received += 1;
        println!("[tether] {}", item);
        if received == args.limit {
            tracing::debug!(received, "item limit reached, stopping stream");
            match args.stop {
                StopMode::Cancel => session.cancel(),
                StopMode::Complete => session.supervisor.complete(),
            }
        }
    }

    let summary = session.supervisor.wait();
    print_summary(&summary, received);
    Ok(())
}

fn print_summary(summary: &SessionSummary, received: usize) {
    println!("[tether] received {} items", received);
    for report in &summary.workers {
        let exit = match &report.exit {
            WorkerExit::Closed => "stream closed".to_string(),
            WorkerExit::ProduceFailed(err) => err.to_string(),
            WorkerExit::Panicked(message) => format!("panicked: {}", message),
        };
        println!("[tether] worker {}: {} pushed, {}", report.id, report.pushed, exit);
    }
}

fn load_init(library: &Path, symbol: &str) -> miette::Result<InitFn> {
    let mut libs = LOADED_LIBS
        .lock()
        .map_err(|_| miette::miette!("Library cache poisoned"))?;

    if !libs.contains_key(library) {
        tracing::debug!(library = %library.display(), "loading native library");
        let lib = unsafe { Library::new(library) }
            .map_err(|e| miette::miette!("Failed to load library {}: {}", library.display(), e))?;
        libs.insert(library.to_path_buf(), lib);
    }

    let lib = libs
        .get(library)
        .ok_or_else(|| miette::miette!("Library not loaded: {}", library.display()))?;
    let init = unsafe { lib.get::<InitFn>(symbol.as_bytes()) }
        .map_err(|e| miette::miette!("Symbol '{}' not found: {}", symbol, e))?;
    Ok(*init)
}

fn run_native(library: &Path, symbol: &str, limit: usize, capacity: usize) -> miette::Result<()> {
    println!("Loading: {}", library.display());
    let init = load_init(library, symbol)?;

    let stream = NativeStream::new(capacity);
    unsafe { init(stream.into_raw_handle()) };
    println!("[tether] finished synchronous call to `{}`", symbol);

    let mut received = 0;
    for item in stream.items().iter() {
        received += 1;
        match item {
            Ok(text) => println!("[tether] {}", text),
            Err(e) => tracing::warn!(error = %e, "native item was not valid UTF-8"),
        }
        if received == limit {
            tracing::debug!(received, "item limit reached, cancelling native stream");
            stream.cancel();
        }
    }

    // 通道在原生侧交还句柄后关闭
    println!(
        "[tether] native side released the handle: {:?}, {} items pushed",
        stream.handle().close_reason(),
        stream.handle().pushed()
    );
    Ok(())
}
