use docsplus::nm::handlers::{handle_connection, NmContext};
use docsplus::nm::registry::{run_monitor, SsRegistry};
use docsplus::nm::replicator::Replicator;
use docsplus::nm::state::NmState;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <nm_ctrl_port> [--state <path>]", args[0]);
        eprintln!("Example: {} 6000", args[0]);
        std::process::exit(1);
    }

    let port: u16 = args[1].parse()?;
    let mut state_path = std::env::var("NM_STATE_PATH").unwrap_or_else(|_| "nm_state.json".into());
    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--state" if i + 1 < args.len() => {
                state_path = args[i + 1].clone();
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let replica_target = std::env::var("REPLICA_TARGET")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1);
    let workers = std::env::var("REPLICATION_WORKERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(4);

    let state = Arc::new(Mutex::new(
        NmState::load(&PathBuf::from(&state_path)).await?,
    ));
    let registry = SsRegistry::new();
    let replicator = Replicator::start(registry.clone(), workers);
    let ctx = Arc::new(NmContext {
        state: state.clone(),
        registry: registry.clone(),
        replicator,
        replica_target,
    });

    tokio::spawn(run_monitor(registry, state.clone()));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("naming manager listening on port {}", port);
    tracing::info!("state document: {}", state_path);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_connection(ctx, stream, peer.ip().to_string()).await;
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

    // In-flight handlers drain on their own connections; save once more
    // so a clean shutdown never loses the last mutation.
    if let Err(e) = state.lock().await.save().await {
        tracing::error!("final state save failed: {}", e);
    }
    Ok(())
}
