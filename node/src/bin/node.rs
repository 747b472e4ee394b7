use clap::{Arg, Command};
use prometheus_client::registry::Registry;
use shardline_node::{
    server::{router, run},
    Config,
};
use std::{str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() {
    // Parse arguments
    let matches = Command::new("shardline-node")
        .about("replicate requests across servers as erasure-coded shards")
        .arg(Arg::new("config").long("config").required(true))
        .get_matches();

    // Load config
    let config_file = matches.get_one::<String>("config").unwrap();
    let config = Config::load(config_file).expect("Could not load config file");

    // Create logger
    let level = Level::from_str(&config.log_level).expect("Invalid log level");
    tracing_subscriber::fmt()
        .json()
        .with_max_level(level)
        .with_line_number(true)
        .with_file(true)
        .init();
    info!(
        me = config.me,
        servers = config.servers.len(),
        listen = %config.listen,
        shards_per_server = config.shards_per_server,
        "loaded config"
    );

    // Create engine
    let mut registry = Registry::with_prefix("shardline");
    let engine = Arc::new(config.engine(&mut registry).expect("Could not create engine"));
    let sweeper = engine.start();
    info!(coding = ?engine.coding(), "started engine");

    // Serve
    let listener = TcpListener::bind(config.listen)
        .await
        .expect("Could not bind to listen address");
    let router = router(
        engine,
        Arc::new(registry),
        &config.receive_path,
        config.body_limit(),
    );
    if let Err(err) = run(listener, router).await {
        error!(?err, "server failed");
    }
    sweeper.abort();
}
