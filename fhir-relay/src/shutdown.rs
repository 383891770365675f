use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Why the relay is stopping. Only the first reason raised is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    ForwardingFailed { topic: String, offset: i64 },
    ConsumerEvicted { topic: String },
    ConsumerFatal { topic: String },
    Subscribe { topic: String },
}

impl ShutdownReason {
    /// Anything but an operator asking the relay to stop is a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, ShutdownReason::Signal)
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "termination signal"),
            ShutdownReason::ForwardingFailed { topic, offset } => {
                write!(f, "failed to forward {}@{}", topic, offset)
            }
            ShutdownReason::ConsumerEvicted { topic } => {
                write!(f, "consumer for {} left the group", topic)
            }
            ShutdownReason::ConsumerFatal { topic } => {
                write!(f, "fatal consumer error on {}", topic)
            }
            ShutdownReason::Subscribe { topic } => write!(f, "could not subscribe to {}", topic),
        }
    }
}

/// Process-wide stop signal shared by every partition worker, plus the barrier the
/// main task waits on until every worker has drained.
///
/// Raising is idempotent and cannot be undone.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
    tracker: TaskTracker,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, reason: ShutdownReason) {
        match self.reason.set(reason.clone()) {
            Ok(()) => info!(%reason, "shutting down"),
            Err(_) => info!(%reason, "already shutting down"),
        }
        self.token.cancel();
    }

    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.get()
    }

    /// Resolves once shutdown has been raised.
    pub fn raised(&self) -> impl Future<Output = ()> + Send + 'static {
        self.token.clone().cancelled_owned()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Wait for every spawned task to finish. No task can be spawned afterwards.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Raise shutdown on SIGINT or SIGTERM. Returns early if shutdown was raised for
    /// another reason first.
    pub async fn listen_for_signals(&self) {
        let mut sigterm = match tokio::signal::unix::signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler, only listening for SIGINT");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = self.raised() => return,
                }
                self.raise(ShutdownReason::Signal);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = self.raised() => return,
        }
        self.raise(ShutdownReason::Signal);
    }
}
