use clap::Parser;
use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use walle::{AppConfig, ClientConfig, Context, MemoryDiscovery};
use walle_demo::{APP_NAME, Request, echo_service, greet_service};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Discovery snapshot written by the demo server.
    #[arg(default_value = "demo-snapshot.json")]
    pub snapshot: PathBuf,

    /// Client config file (JSON). Defaults apply to missing fields.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Request value.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    /// Use MessagePack
    #[arg(long, default_value_t = false)]
    pub use_msgpack: bool,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct Counter {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(ctx: Context, args: Args) {
    let counter = Arc::new(Counter::default());
    let start_time = std::time::Instant::now();
    let secs = args.secs;
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let value = Request(args.value.clone());
        let counter = counter.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            let key = echo_service();
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = ctx.call::<_, String>(&key, "echo", &value).await;
                    counter.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        counter.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                task.await.unwrap();
            }
        } => {
        }
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = counter.total.swap(0, Ordering::AcqRel);
                let fails = counter.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {
        }
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path).unwrap(),
        None => ClientConfig::default(),
    };
    config.use_msgpack |= args.use_msgpack;
    let discovery = Arc::new(MemoryDiscovery::from_json_file(&args.snapshot).unwrap());

    let ctx = Context::create(&config);
    let app = ctx.app(AppConfig::new(APP_NAME), discovery);
    app.init().await.unwrap();
    tracing::info!("connected to {:?}", app.server_addresses().await);

    if args.stress {
        stress_test(ctx, args).await;
    } else {
        let value = Request(args.value.clone());
        let rsp = ctx.call::<_, String>(&echo_service(), "echo", &value).await;
        tracing::info!("echo rsp: {:?}", rsp);

        let rsp = ctx.call::<_, String>(&greet_service(), "greet", &value).await;
        tracing::info!("greet rsp: {:?}", rsp);
    }
    app.close().await;
}
