use std::{
    error::Error,
    sync::{Arc, mpsc},
    time::{Duration, Instant},
};

use clap::Parser;
use log::{info, warn};
use nodenet::{
    Message, MessageConstructor, Network, NetworkConfig, NodeEntry, NodeId, Request,
    StaticNodeMap,
};

const PING: (u8, u8) = (1, 1);
const PONG: (u8, u8) = (1, 2);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Id of this node, decimal or 0x prefixed hex
    #[arg(long)]
    id: NodeId,
    /// Node table entry ID=ADDR; repeat for every node, this one included
    #[arg(long = "node", required = true)]
    nodes: Vec<NodeEntry>,
    /// Node to ping once started
    #[arg(long)]
    ping: Option<NodeId>,
    /// Number of pings to send
    #[arg(long, default_value_t = 10)]
    count: u32,
    /// Pause between pings in milliseconds
    #[arg(long, default_value_t = 500)]
    interval: u64,
    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout: u64,
    /// Handler threads serving the default lane
    #[arg(long, default_value_t = 2)]
    handlers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut nodes = StaticNodeMap::new(cli.id);
    for entry in &cli.nodes {
        nodes.insert(entry.node, entry.address);
    }

    let config = NetworkConfig::new(cli.id)
        .with_request_timeout(Duration::from_millis(cli.timeout))
        .with_handler_threads(cli.handlers);
    let network = Arc::new(Network::new(config, Arc::new(nodes))?);

    network.register_type(PING.0, PING.1, MessageConstructor::request())?;
    network.register_type(PONG.0, PONG.1, MessageConstructor::response())?;

    let weak = Arc::downgrade(&network);
    network.register_receiver(
        PING.0,
        PING.1,
        Arc::new(move |ping: Message| {
            let Some(network) = weak.upgrade() else {
                return;
            };
            let mut pong = Message::response_to(&ping, PONG.0, PONG.1).with_payload(ping.payload);
            if let Err(e) = network.send(&mut pong) {
                warn!("answering ping {} from {} failed: {e}", ping.id, ping.source);
            }
        }),
    )?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    info!("node {} running, press Ctrl-C to stop", cli.id);

    let mut stopped = false;
    if let Some(target) = cli.ping {
        for seq in 0..cli.count {
            let mut request = Request::new(target, PING.0, PING.1);
            request.encode_payload(seq)?;

            let started = Instant::now();
            match network.send_sync(&mut request, None, true) {
                Ok(()) => println!("pong {seq} from {target} in {:?}", started.elapsed()),
                Err(e) => println!("ping {seq} to {target} failed: {e}"),
            }

            if stop_rx
                .recv_timeout(Duration::from_millis(cli.interval))
                .is_ok()
            {
                stopped = true;
                break;
            }
        }
        print!("{}", network.status());
    }

    if !stopped {
        let _ = stop_rx.recv();
    }

    network.close();
    Ok(())
}
