use std::{
    error::Error,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use log::info;
use stardust::{
    ProtocolServer, TransportConfig,
    net::{DEFAULT_BACKLOG, DEFAULT_PORT},
    protocol::message::install_ping_pong,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Address to bind the listener to
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    address: Ipv4Addr,
    /// Listen backlog
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    backlog: i32,
    /// Poll timeout in milliseconds; bounds shutdown latency
    #[arg(long, default_value_t = 100)]
    poll_timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = TransportConfig::new(cli.port)
        .with_address(cli.address)
        .with_backlog(cli.backlog)
        .with_poll_timeout(Duration::from_millis(cli.poll_timeout_ms));

    let mut server = ProtocolServer::new(config);
    server.set_connect_callback(|id, addr| info!("client {id} connected from {addr}"));
    server.set_server_address_callback(|addr| info!("server address {addr}"));
    server.set_disconnect_callback(|id| info!("client {id} left"));
    install_ping_pong(&server);

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst))?;

    server.start()?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }

    info!("shutting down");
    server.stop();
    Ok(())
}
