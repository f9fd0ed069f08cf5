//! Server lifecycle: listen, race fatal errors against cancellation,
//! drain within a bounded grace period.
//!
//! The serve loop runs on a background task; its fatal error is delivered
//! through the task handle. The foreground `run` waits on whichever comes
//! first: that error (propagated immediately, no drain) or an external
//! shutdown signal (stop accepting, let in-flight requests finish, bounded
//! by the grace period). A second signal while draining forces an
//! immediate return, the escape hatch for an unresponsive drain.
use std::{
    future::IntoFuture,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::connect_info::Connected,
    serve::{IncomingStream, Listener},
};
use thiserror::Error;
use tokio::{signal, sync::broadcast, task::JoinHandle};

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (first SIGINT/SIGTERM)
    Graceful,
    /// Escalation: another signal arrived while already shutting down
    Forced,
}

/// Broadcasts shutdown signals to every part of the process that needs to
/// wind down.
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Request shutdown. The first call broadcasts a graceful drain; every
    /// later call escalates to a forced exit.
    pub fn trigger(&self) {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!("shutdown requested, draining");
            let _ = self.shutdown_tx.send(ShutdownReason::Graceful);
        } else {
            tracing::warn!("repeated shutdown signal, forcing exit");
            let _ = self.shutdown_tx.send(ShutdownReason::Forced);
        }
    }

    /// Listen for OS signals for the lifetime of the process. Every signal
    /// becomes a trigger, so a second Ctrl-C escalates the drain.
    pub async fn run_signal_handler(&self) {
        tracing::info!("signal handler started, listening for SIGINT and SIGTERM");
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    tracing::info!("received SIGINT (Ctrl+C)");
                }
                _ = wait_for_sigterm() => {
                    tracing::info!("received SIGTERM");
                }
            }
            self.trigger();
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // On non-Unix systems, we only have Ctrl+C
    std::future::pending::<()>().await;
}

/// Lifecycle states of the serving loop. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Listening,
    Draining,
    Stopped,
}

impl ServerState {
    fn as_u8(self) -> u8 {
        match self {
            ServerState::NotStarted => 0,
            ServerState::Listening => 1,
            ServerState::Draining => 2,
            ServerState::Stopped => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Listening,
            2 => ServerState::Draining,
            3 => ServerState::Stopped,
            _ => ServerState::NotStarted,
        }
    }
}

/// Errors surfaced by [`ServerLifecycle::run`]. All of them terminate the
/// process; per-request failures never reach this level.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The serve loop failed before any shutdown was requested.
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),

    /// The serve task itself died (panic or runtime teardown).
    #[error("serve task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// In-flight requests outlived the shutdown grace period.
    #[error("shutdown grace period ({0:?}) exceeded while draining")]
    DeadlineExceeded(Duration),

    /// A second shutdown signal arrived while draining.
    #[error("shutdown forced while draining")]
    Forced,
}

/// Owns the listen/serve loop and coordinates shutdown against external
/// cancellation. Cheap to clone; clones share the state.
#[derive(Clone)]
pub struct ServerLifecycle {
    shutdown: Arc<GracefulShutdown>,
    grace_period: Duration,
    state: Arc<AtomicU8>,
}

impl ServerLifecycle {
    pub fn new(shutdown: Arc<GracefulShutdown>, grace_period: Duration) -> Self {
        Self {
            shutdown,
            grace_period,
            state: Arc::new(AtomicU8::new(ServerState::NotStarted.as_u8())),
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Serve until a fatal error or an external shutdown signal.
    ///
    /// Fatal serve errors propagate immediately without a drain attempt.
    /// On the first shutdown signal the listener stops accepting and
    /// in-flight requests get up to the grace period to finish; exceeding
    /// it is a deadline error. A second signal aborts the drain.
    pub async fn run<L>(&self, listener: L, app: Router) -> Result<(), LifecycleError>
    where
        L: Listener<Addr = SocketAddr>,
        for<'a> SocketAddr: Connected<IncomingStream<'a, L>>,
    {
        let mut drain_rx = self.shutdown.subscribe();
        let mut signal_rx = self.shutdown.subscribe();
        let escalation_rx = self.shutdown.subscribe();

        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_rx.recv().await;
        });

        let mut serve_task = tokio::spawn(serve.into_future());
        self.set_state(ServerState::Listening);

        tokio::select! {
            result = &mut serve_task => {
                // the serve loop only returns on its own when it failed
                self.set_state(ServerState::Stopped);
                join_result(result)
            }
            reason = signal_rx.recv() => {
                if reason.unwrap_or(ShutdownReason::Forced) == ShutdownReason::Forced {
                    serve_task.abort();
                    self.set_state(ServerState::Stopped);
                    return Err(LifecycleError::Forced);
                }
                self.set_state(ServerState::Draining);
                tracing::info!(grace_period = ?self.grace_period, "shutdown server");
                self.drain(serve_task, escalation_rx).await
            }
        }
    }

    /// Bounded drain: whichever happens first wins.
    async fn drain(
        &self,
        mut serve_task: JoinHandle<std::io::Result<()>>,
        escalation_rx: broadcast::Receiver<ShutdownReason>,
    ) -> Result<(), LifecycleError> {
        let result = tokio::select! {
            result = &mut serve_task => join_result(result),
            _ = tokio::time::sleep(self.grace_period) => {
                // whatever is still in flight gets abandoned
                serve_task.abort();
                Err(LifecycleError::DeadlineExceeded(self.grace_period))
            }
            _ = forced_signal(escalation_rx) => {
                serve_task.abort();
                Err(LifecycleError::Forced)
            }
        };
        self.set_state(ServerState::Stopped);
        result
    }
}

fn join_result(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), LifecycleError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(LifecycleError::Serve(err)),
        Err(err) => Err(LifecycleError::Task(err)),
    }
}

/// Resolves only once a forced shutdown is broadcast.
async fn forced_signal(mut rx: broadcast::Receiver<ShutdownReason>) {
    loop {
        match rx.recv().await {
            Ok(ShutdownReason::Forced) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(ShutdownReason::Graceful) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}
