//! Process-wide cancellation
//!
//! A [`Shutdown`] is the trigger side, a [`ShutdownListener`] the waiting
//! side. Both wrap a `watch` channel, so a listener that starts waiting after
//! the interrupt has already fired still sees it immediately.

use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Trigger side of the cancellation signal
#[derive(Clone, Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

/// Waiting side of the cancellation signal
#[derive(Clone, Debug)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    /// Create a listener; it observes triggers that happened before creation
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// Cancel everything waiting on this signal
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger on Ctrl+C, or SIGTERM on unix
    ///
    /// On unix the handlers are installed before this returns, so a signal
    /// that arrives afterwards is always caught. Must be called from within a
    /// tokio runtime. Returns a listener for convenience.
    pub fn listen_for_signals(&self) -> ShutdownListener {
        let signal = install_signal_handlers();
        let shutdown = self.clone();
        tokio::spawn(async move {
            signal.await;
            info!("Received interrupt signal, terminating...");
            shutdown.trigger();
        });
        self.listener()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownListener {
    /// A listener that never fires
    pub fn never() -> Self {
        Shutdown::new().listener()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation has been requested
    ///
    /// Resolves immediately if it already was. If every trigger handle has been
    /// dropped without firing, this never resolves.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
fn install_signal_handlers() -> impl Future<Output = ()> + Send + 'static {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = signal(SignalKind::interrupt())
        .map_err(|e| warn!("Failed to install SIGINT handler: {}", e))
        .ok();
    let terminate = signal(SignalKind::terminate())
        .map_err(|e| warn!("Failed to install SIGTERM handler: {}", e))
        .ok();

    async move {
        tokio::select! {
            _ = recv_or_pending(interrupt) => debug!("SIGINT received"),
            _ = recv_or_pending(terminate) => debug!("SIGTERM received"),
        }
    }
}

#[cfg(unix)]
async fn recv_or_pending(stream: Option<tokio::signal::unix::Signal>) {
    match stream {
        Some(mut stream) => {
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() -> impl Future<Output = ()> + Send + 'static {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        debug!("Ctrl+C received");
    }
}
