//! Accept loop wrapper with connection draining.
//!
//! Every accepted connection carries a [`DrainGuard`]; the listener only
//! finishes shutting down once all guards are dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Notify};

#[derive(Debug, Default)]
struct DrainState {
    active: AtomicUsize,
    idle: Notify,
}

/// Counter of in-flight connections.
#[derive(Debug, Clone, Default)]
pub struct DrainGroup {
    state: Arc<DrainState>,
}

impl DrainGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one more in-flight connection until the guard is dropped.
    pub fn track(&self) -> DrainGuard {
        self.state.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of live guards.
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Resolves once no guards are alive.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps a connection counted in its [`DrainGroup`].
#[derive(Debug)]
pub struct DrainGuard {
    state: Arc<DrainState>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.state.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Sending half of the stop signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Creates a trigger and its first receiver.
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, ShutdownSignal { rx })
    }

    /// Fires the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Another receiver for the same signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half of the stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires.
    ///
    /// Dropping every [`Shutdown`] counts as firing it.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// An accepted connection plus the guard that keeps it counted.
#[derive(Debug)]
pub struct Accepted {
    /// The client socket.
    pub stream: TcpStream,
    /// Client address.
    pub peer: SocketAddr,
    /// Drop when the connection is finished.
    pub guard: DrainGuard,
}

/// Lifecycle of a [`GracefulListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Accepting connections.
    Listening,
    /// No longer accepting; waiting for live connections.
    Draining,
    /// All connections finished.
    Stopped,
}

/// TCP listener that tracks accepted connections for draining.
#[derive(Debug)]
pub struct GracefulListener {
    listener: TcpListener,
    drain: DrainGroup,
    signal: ShutdownSignal,
    state: ListenerState,
}

impl GracefulListener {
    /// Binds a new listener that stops accepting once `signal` fires.
    pub async fn bind(addr: impl ToSocketAddrs, signal: ShutdownSignal) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::new(listener, signal))
    }

    /// Wraps an already bound listener.
    pub fn new(listener: TcpListener, signal: ShutdownSignal) -> Self {
        Self {
            listener,
            drain: DrainGroup::new(),
            signal,
            state: ListenerState::Listening,
        }
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The group tracking this listener's connections.
    pub fn drain_group(&self) -> &DrainGroup {
        &self.drain
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Waits for the next connection.
    ///
    /// Returns `None` once the shutdown signal has fired.
    pub async fn accept(&mut self) -> Option<io::Result<Accepted>> {
        if self.state != ListenerState::Listening {
            return None;
        }
        if self.signal.is_triggered() {
            self.state = ListenerState::Draining;
            return None;
        }

        tokio::select! {
            biased;
            _ = self.signal.triggered() => {
                self.state = ListenerState::Draining;
                None
            }
            result = self.listener.accept() => Some(result.map(|(stream, peer)| Accepted {
                stream,
                peer,
                guard: self.drain.track(),
            })),
        }
    }

    /// Closes the socket and waits for every tracked connection to finish.
    pub async fn shutdown(self) -> ListenerState {
        let Self { listener, drain, .. } = self;
        drop(listener);

        let active = drain.active();
        if active > 0 {
            tracing::info!("Waiting for {} connection(s) to finish", active);
        }
        drain.wait_idle().await;

        tracing::debug!("Listener stopped");
        ListenerState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_group_counts_guards() {
        let group = DrainGroup::new();
        assert_eq!(group.active(), 0);

        let a = group.track();
        let b = group.track();
        assert_eq!(group.active(), 2);

        drop(a);
        assert_eq!(group.active(), 1);
        drop(b);
        assert_eq!(group.active(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let group = DrainGroup::new();
        tokio::time::timeout(Duration::from_secs(1), group.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_idle_waits_for_last_guard() {
        let group = DrainGroup::new();
        let guard = group.track();

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_signal_fires_for_all_receivers() {
        let (shutdown, mut first) = Shutdown::new();
        let mut second = shutdown.subscribe();
        assert!(!first.is_triggered());

        shutdown.trigger();
        shutdown.trigger();

        first.triggered().await;
        second.triggered().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn dropped_trigger_releases_receivers() {
        let (shutdown, mut signal) = Shutdown::new();
        drop(shutdown);

        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn accept_tracks_connections() {
        let (shutdown, signal) = Shutdown::new();
        let mut listener = GracefulListener::bind("127.0.0.1:0", signal).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = listener.accept().await.unwrap().unwrap();
        assert_eq!(accepted.peer.ip(), addr.ip());
        assert_eq!(listener.drain_group().active(), 1);

        drop(accepted);
        assert_eq!(listener.drain_group().active(), 0);

        shutdown.trigger();
        assert!(listener.accept().await.is_none());
        assert_eq!(listener.state(), ListenerState::Draining);
    }

    #[tokio::test]
    async fn shutdown_waits_for_live_connections() {
        let (shutdown, signal) = Shutdown::new();
        let mut listener = GracefulListener::bind("127.0.0.1:0", signal).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = listener.accept().await.unwrap().unwrap();

        shutdown.trigger();
        assert!(listener.accept().await.is_none());

        let stopping = tokio::spawn(listener.shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        drop(accepted);
        let state = tokio::time::timeout(Duration::from_secs(1), stopping)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, ListenerState::Stopped);
    }

    #[tokio::test]
    async fn closed_listener_refuses_new_connections() {
        let (shutdown, signal) = Shutdown::new();
        let listener = GracefulListener::bind("127.0.0.1:0", signal).await.unwrap();
        let addr = listener.local_addr().unwrap();

        shutdown.trigger();
        listener.shutdown().await;

        assert!(TcpStream::connect(addr).await.is_err());
    }
}
