//! Remoting host: serves the sample `Calculator` over TCP, or calls it.

mod calculator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use remoting::Config;
use remoting::Connection;
use remoting::Value;
use remoting::transport::tcp::TcpTransport;
use tokio::net::TcpListener;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::calculator::TickPrinter;

#[derive(Parser, Debug)]
#[command(name = "remoting-host")]
#[command(about = "Serves or calls a remote Calculator")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept clients and serve the Calculator type
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "8089")]
        port: u16,

        /// Exit when the first client disconnects
        #[arg(long)]
        kill_self: bool,
    },
    /// Connect, create a Calculator and call it
    Client {
        /// Server address
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,

        /// Server port
        #[arg(short, long, default_value = "8089")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .compact()
        .init();

    match cli.command {
        Command::Server { port, kill_self } => serve(port, kill_self).await,
        Command::Client { ip, port } => call(&ip, port).await,
    }
}

async fn serve(port: u16, kill_self: bool) -> Result<()> {
    let surrogates = Arc::new(calculator::surrogates());
    let config = Config::default();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {}", port))?;
    info!("listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("client connected from {}", peer);
        let transport = TcpTransport::from_stream(stream, config.max_frame_len);
        let conn = Connection::new(
            Box::new(transport),
            surrogates.clone(),
            config.clone().with_side_name(format!("server:{}", peer)),
        );

        let watcher = tokio::spawn(async move {
            conn.closed().await;
            info!("client {} disconnected", peer);
        });
        if kill_self {
            watcher.await?;
            info!("first client gone, exiting");
            return Ok(());
        }
    }
}

async fn call(ip: &str, port: u16) -> Result<()> {
    let config = Config::default().with_side_name("client");
    let transport = TcpTransport::connect((ip, port), config.max_frame_len)
        .await
        .with_context(|| format!("connecting to {}:{}", ip, port))?;
    let conn = Connection::new(Box::new(transport), Arc::new(calculator::surrogates()), config);

    let calc = conn.create_instance("Calculator", ()).await?;
    info!("created {} ({})", calc.type_name(), calc.id());

    let sum: i64 = calc.call_as("AddValues", (2i64, 5i64)).await?;
    info!("AddValues(2, 5) = {}", sum);

    let printer = Arc::new(TickPrinter);
    calc.call("Subscribe", (Value::shared(printer.clone()),)).await?;
    calc.call("StartTicker", (3i64, 100u64)).await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    drop(calc);
    if let Err(e) = conn.shutdown().await {
        warn!("shutdown: {}", e);
    }
    Ok(())
}
