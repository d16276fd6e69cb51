use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use walle::{AppConfig, ServerAddress, ServerUrl};
use walle_demo::{APP_NAME, DemoServer, server_info};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: std::net::SocketAddr,

    /// Where to write the discovery snapshot clients load.
    #[arg(long, default_value = "demo-snapshot.json")]
    pub snapshot: PathBuf,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let listener = tokio::net::TcpListener::bind(args.addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = ServerUrl {
        address: ServerAddress::new(addr.ip().to_string(), addr.port()),
        version: Some("1.0".into()),
        protocol: Some("walle".into()),
    };

    let path = format!("{}/{url}", AppConfig::new(APP_NAME).servers_path());
    let snapshot = serde_json::json!({ path: server_info() });
    std::fs::write(&args.snapshot, serde_json::to_vec_pretty(&snapshot).unwrap()).unwrap();
    tracing::info!(
        "Serving {:?} on {url}, snapshot written to {}",
        server_info().interface_keys(),
        args.snapshot.display()
    );

    if let Err(e) = Arc::new(DemoServer::default()).serve(listener).await {
        tracing::error!("server stopped: {e}");
    }
}
