use replica_ledger::log_with_host;
use replica_ledger::network::http::start_server;
use replica_ledger::network::HttpTransport;
use replica_ledger::storage::SqliteStorage;
use replica_ledger::{KvApplier, Node, NodeConfig, NodeIdentity};
use std::env;
use std::error::Error;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

/// `rust-replica-ledger keygen` prints a fresh key pair for `REPLICA_PRIVATE_KEY`.
fn keygen() {
    let identity = NodeIdentity::generate();
    println!("REPLICA_PRIVATE_KEY={}", identity.private_key_hex());
    println!("public key: {}", identity.public_key());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    if env::args().nth(1).as_deref() == Some("keygen") {
        keygen();
        return Ok(());
    }

    #[cfg(feature = "json")]
    replica_ledger::logger::init_logger_json();
    #[cfg(not(feature = "json"))]
    replica_ledger::logger::init_logger();

    let config = NodeConfig::from_env()?;
    let storage = match config.db_path.as_deref() {
        Some(path) => SqliteStorage::open(path)?,
        None => SqliteStorage::open_in_memory()?,
    };
    let transport = HttpTransport::new(config.send_timeout())?;
    let bind = config.address.clone();

    log_with_host!(
        info,
        address = %config.address,
        peers = config.peers.len(),
        public_key = %config.identity.public_key(),
        "Starting replica"
    );

    let node = Node::new(config, transport, storage, Arc::new(KvApplier))?;

    let server_node = node.clone();
    thread::spawn(move || {
        actix_rt::System::new().block_on(async {
            if let Err(e) = start_server(bind, server_node).await {
                error!(error = %e, "HTTP server stopped");
            }
        });
    });

    node.connect()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.disconnect().await?;
    Ok(())
}
