//! Replication Workers
//!
//! Every state-changing path that affects file bytes or structure
//! enqueues fire-and-forget tasks here. Tasks carry everything by value
//! and are drained by a small worker pool; the only shared touchpoint is
//! the queue gauge exposed via `STATS`. Failures are logged and never
//! surfaced to the originating client; replication is asynchronous
//! best-effort.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::registry::SsRegistry;
use super::ssclient;

/// A raw structural command forwarded to a replica without a body
/// transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdOp {
    Create,
    Delete,
    Rename,
}

/// One unit of replication work.
#[derive(Debug, Clone)]
pub enum ReplTask {
    /// Fetch the current body from the primary, PUT it to the target.
    Put {
        file: String,
        primary: u32,
        target: u32,
    },
    /// Fetch a named checkpoint from the primary, PUT_CHECKPOINT it.
    PutCheckpoint {
        file: String,
        name: String,
        primary: u32,
        target: u32,
    },
    /// Fetch the undo snapshot from the primary (via the READ
    /// pseudo-path), PUT_UNDO it. Skipped quietly when no snapshot
    /// exists.
    PutUndo {
        file: String,
        primary: u32,
        target: u32,
    },
    /// Forward a CREATE/DELETE/RENAME to the target.
    Cmd {
        op: CmdOp,
        file: String,
        new_file: Option<String>,
        target: u32,
    },
}

pub struct Replicator {
    tx: mpsc::UnboundedSender<(String, ReplTask)>,
    queued: AtomicI64,
    registry: Arc<SsRegistry>,
}

impl Replicator {
    /// Spawn `workers` drain tasks and return the shared handle.
    pub fn start(registry: Arc<SsRegistry>, workers: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<(String, ReplTask)>();
        let replicator = Arc::new(Self {
            tx,
            queued: AtomicI64::new(0),
            registry,
        });

        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..workers.max(1) {
            let replicator = replicator.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some((task_id, task)) = next else {
                        break;
                    };
                    if let Err(e) = replicator.run_task(&task).await {
                        tracing::warn!("replication task {} failed: {}", task_id, e);
                    }
                    replicator.queued.fetch_sub(1, Ordering::Relaxed);
                }
                tracing::debug!("replication worker {} stopped", worker_id);
            });
        }

        replicator
    }

    /// Outstanding (queued or in-flight) task count.
    pub fn queue_depth(&self) -> i64 {
        self.queued.load(Ordering::Relaxed).max(0)
    }

    pub fn enqueue(&self, task: ReplTask) {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.queued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("queued replication task {}: {:?}", task_id, task);
        if self.tx.send((task_id, task)).is_err() {
            // Workers are gone; drop the count we just took.
            self.queued.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Convenience: one PUT per replica of `file`.
    pub fn fan_out_put(&self, file: &str, primary: u32, replicas: &[u32]) {
        for &target in replicas {
            self.enqueue(ReplTask::Put {
                file: file.to_string(),
                primary,
                target,
            });
        }
    }

    pub fn fan_out_cmd(&self, op: CmdOp, file: &str, new_file: Option<&str>, replicas: &[u32]) {
        for &target in replicas {
            self.enqueue(ReplTask::Cmd {
                op,
                file: file.to_string(),
                new_file: new_file.map(String::from),
                target,
            });
        }
    }

    async fn run_task(&self, task: &ReplTask) -> anyhow::Result<()> {
        match task {
            ReplTask::Put {
                file,
                primary,
                target,
            } => {
                let src = self.addr_of(*primary)?;
                let dst = self.addr_of(*target)?;
                let body = ssclient::read_body(&src, *primary, file).await?;
                ssclient::put_body(&dst, file, &body).await?;
                tracing::info!("replicated PUT {} -> ss{}", file, target);
            }
            ReplTask::PutCheckpoint {
                file,
                name,
                primary,
                target,
            } => {
                let src = self.addr_of(*primary)?;
                let dst = self.addr_of(*target)?;
                let body = ssclient::view_checkpoint(&src, *primary, file, name).await?;
                ssclient::put_checkpoint(&dst, file, name, &body).await?;
                tracing::info!("replicated CHECKPOINT {}@{} -> ss{}", file, name, target);
            }
            ReplTask::PutUndo {
                file,
                primary,
                target,
            } => {
                let src = self.addr_of(*primary)?;
                // No snapshot on the primary is the common case, not a
                // failure.
                let Ok(body) = ssclient::read_undo_body(&src, *primary, file).await else {
                    return Ok(());
                };
                let dst = self.addr_of(*target)?;
                ssclient::put_undo(&dst, file, &body).await?;
                tracing::info!("replicated UNDO {} -> ss{}", file, target);
            }
            ReplTask::Cmd {
                op,
                file,
                new_file,
                target,
            } => {
                let dst = self.addr_of(*target)?;
                match op {
                    CmdOp::Create => {
                        ssclient::create(&dst, file).await?;
                    }
                    CmdOp::Delete => {
                        ssclient::delete(&dst, file).await?;
                    }
                    CmdOp::Rename => {
                        let new_file = new_file
                            .as_deref()
                            .ok_or_else(|| anyhow::anyhow!("rename task without target name"))?;
                        ssclient::rename(&dst, file, new_file).await?;
                    }
                }
                tracing::info!("replicated {:?} {} -> ss{}", op, file, target);
            }
        }
        Ok(())
    }

    fn addr_of(&self, ss_id: u32) -> anyhow::Result<String> {
        self.registry
            .data_addr(ss_id)
            .ok_or_else(|| anyhow::anyhow!("storage server {} has no data endpoint", ss_id))
    }
}
