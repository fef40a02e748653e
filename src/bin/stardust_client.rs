use std::{error::Error, net::SocketAddr, net::TcpStream, time::Instant};

use clap::Parser;
use log::debug;
use stardust::protocol::{FramedStream, MessageId, PING, PONG, Ping, Pong};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address, e.g. 127.0.0.1:12345
    address: SocketAddr,
    /// Number of pings to send
    #[arg(short, long, default_value_t = 1)]
    count: u32,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let stream = TcpStream::connect(cli.address)?;
    stream.set_nodelay(true)?;
    let mut transport = FramedStream::new(stream);
    debug!("connected to {}", transport.get_ref().peer_addr()?);

    for value in 0..cli.count {
        let started = Instant::now();
        transport.write_message(PING, &Ping { value })?;

        let (id, pong): (MessageId, Pong) = transport.read_message()?;
        if id != PONG {
            debug!("unexpected reply {id}");
            continue;
        }
        println!("pong {} in {:?}", pong.value, started.elapsed());
    }

    Ok(())
}
