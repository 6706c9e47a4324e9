//! Demo: echo traffic between two simulated hosts over a bad link.
//!
//! Run with `RUST_LOG=debug` to watch the handshake, retransmissions
//! and duplicate suppression at work.

use std::net::Ipv4Addr;

use clap::Parser;

use rdt_transport::{Network, RdtError, RdtProtocol, SimulatorConfig};

/// Round-trips a batch of messages between two simulated hosts over a
/// link that corrupts and drops frames.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Probability that the link drops a frame.
    #[arg(long, default_value_t = 0.05)]
    loss_rate: f64,

    /// Probability that the link corrupts a frame.
    #[arg(long, default_value_t = 0.1)]
    corrupt_rate: f64,

    /// Seed for the link's fault pattern.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Number of messages the client sends.
    #[arg(long, default_value_t = 8)]
    messages: usize,

    /// Server port on the first host.
    #[arg(long, default_value_t = 5000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let net = Network::new(SimulatorConfig {
        loss_rate: args.loss_rate,
        corrupt_rate: args.corrupt_rate,
        seed: args.seed,
    });
    let server_host = net.add_host(Ipv4Addr::new(10, 0, 0, 1));
    let client_host = net.add_host(Ipv4Addr::new(10, 0, 0, 2));
    let server_proto = RdtProtocol::register(&server_host);
    let client_proto = RdtProtocol::register(&client_host);

    let server_addr = server_host.addr();
    let port = args.port;
    let count = args.messages;

    // Echo server: accept one connection, bounce every message back.
    let server = tokio::spawn(async move {
        let mut listener = server_proto.socket();
        listener.bind(port)?;
        listener.listen()?;
        let (mut conn, peer) = listener.accept().await?;
        log::info!("[demo] server: connection from {}:{}", peer.0, peer.1);
        for _ in 0..count {
            let msg = conn.recv(1024).await;
            conn.send(&msg).await?;
        }
        Ok::<_, RdtError>(())
    });

    let client = tokio::spawn(async move {
        let mut sock = client_proto.socket();
        sock.connect((server_addr, port)).await?;
        for i in 0..count {
            let msg = format!("message {i}");
            sock.send(msg.as_bytes()).await?;
            let echo = sock.recv(1024).await;
            println!("echo {i}: {}", String::from_utf8_lossy(&echo));
        }
        Ok::<_, RdtError>(())
    });

    client.await??;
    server.await??;

    let stats = net.stats();
    println!(
        "link: {} transmitted, {} delivered, {} corrupted, {} lost",
        stats.transmitted(),
        stats.delivered(),
        stats.corrupted(),
        stats.lost()
    );
    Ok(())
}
