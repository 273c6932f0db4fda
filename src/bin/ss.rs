use docsplus::proto::framing::request_once;
use docsplus::proto::message::{BasicReply, NmRequest};
use docsplus::ss::handlers::{handle_connection, SsContext};
use docsplus::ss::session::SentenceLocks;
use docsplus::ss::store::SsStore;

use std::sync::Arc;
use std::time::Duration;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 5 {
        eprintln!(
            "Usage: {} <nm_host> <nm_port> <ss_ctrl_port> <ss_data_port> [ss_id]",
            args[0]
        );
        std::process::exit(1);
    }
    let nm_host = args[1].clone();
    let nm_port: u16 = args[2].parse()?;
    let ss_ctrl_port: u16 = args[3].parse()?;
    let ss_data_port: u16 = args[4].parse()?;
    let ss_id: u32 = if args.len() >= 6 {
        args[5].parse()?
    } else {
        ss_ctrl_port as u32
    };

    let data_root = std::env::var("SS_DATA_ROOT").unwrap_or_else(|_| "ss_data".into());
    let store = SsStore::open(&data_root, ss_id).await?;
    let nm_addr = format!("{}:{}", nm_host, nm_port);

    // Bind the data port first so we never register an endpoint we cannot
    // actually serve.
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", ss_data_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!(
                "data port {} unavailable ({}); another process may be using it",
                ss_data_port, e
            );
            std::process::exit(1);
        }
    };

    let register = NmRequest::SsRegister {
        ss_id,
        ss_ctrl_port,
        ss_data_port,
    };
    match request_once::<_, BasicReply>(&nm_addr, &register).await {
        Ok(reply) => tracing::info!("registered with naming manager: {:?}", reply.status),
        Err(e) => {
            eprintln!("registration with naming manager failed: {}", e);
            std::process::exit(1);
        }
    }

    let ctx = Arc::new(SsContext {
        ss_id,
        store,
        locks: SentenceLocks::new(),
        nm_addr: nm_addr.clone(),
    });

    // Heartbeat loop; a missed beat window makes the naming manager
    // promote a replica, the next beat brings us back with a resync.
    {
        let nm_addr = nm_addr.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                let beat = NmRequest::SsHeartbeat { ss_id };
                if let Err(e) = request_once::<_, BasicReply>(&nm_addr, &beat).await {
                    tracing::debug!("heartbeat failed: {}", e);
                }
            }
        });
    }

    tracing::info!("storage server ss{} serving data on port {}", ss_id, ss_data_port);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("accepted {}", peer);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_connection(ctx, stream).await;
                        });
                    }
                    Err(e) => tracing::error!("accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
