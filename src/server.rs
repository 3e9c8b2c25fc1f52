//! DNS server instance: UDP listener and lifecycle.
//!
//! A [`DnsServer`] is bound to one config snapshot for its whole life. Only the
//! rule set can change while it runs. A config change means a new instance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::router::{QueryRouter, MAX_DATAGRAM};
use crate::rules::{RuleSet, SharedRules};
use crate::trigger::Dispatcher;

/// Time in-flight queries get to finish once shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Consecutive receive errors after which the listener gives up and reports a fault.
const MAX_RECV_ERRORS: usize = 64;

enum ServerState {
    Idle,
    Running {
        local_addr: SocketAddr,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    },
}

/// UDP DNS proxy bound to one config snapshot.
pub struct DnsServer {
    config: Arc<Config>,
    rules: SharedRules,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ServerState>,
}

impl DnsServer {
    /// Create a stopped server.
    pub fn new(config: Arc<Config>, rules: Arc<RuleSet>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            rules: SharedRules::new(rules),
            dispatcher,
            state: Mutex::new(ServerState::Idle),
        }
    }

    /// Swap the rule set used by subsequent queries. Does not restart the listener.
    pub fn set_rules(&self, rules: Arc<RuleSet>) {
        self.rules.store(rules);
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            ServerState::Running { local_addr, .. } => Some(*local_addr),
            ServerState::Idle => None,
        }
    }

    /// Bind the listen socket and start serving on a separate task.
    ///
    /// Faults that end the listener after a successful start are sent on `faults`.
    pub async fn start(
        &self,
        faults: mpsc::UnboundedSender<ServerError>,
    ) -> Result<SocketAddr, ServerError> {
        let mut state = self.state.lock().await;
        if matches!(*state, ServerState::Running { .. }) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.config.server.addr();
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "Listening");

        let router = Arc::new(QueryRouter::new(
            self.config.clone(),
            self.rules.clone(),
            self.dispatcher.clone(),
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve(
            Arc::new(socket),
            router,
            shutdown.clone(),
            faults,
        ));

        *state = ServerState::Running {
            local_addr,
            shutdown,
            handle,
        };
        Ok(local_addr)
    }

    /// Stop serving and wait until the listen socket is released.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        let ServerState::Running {
            shutdown, handle, ..
        } = std::mem::replace(&mut *state, ServerState::Idle)
        else {
            return Err(ServerError::NotRunning);
        };

        shutdown.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Listener task failed");
        }

        info!("Server stopped");
        Ok(())
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    router: Arc<QueryRouter>,
    shutdown: CancellationToken,
    faults: mpsc::UnboundedSender<ServerError>,
) {
    let mut in_flight = JoinSet::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut recv_errors = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Listener shutting down");
                break;
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Query task failed");
                }
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        recv_errors = 0;
                        let query = buf[..len].to_vec();
                        let router = router.clone();
                        let socket = socket.clone();

                        in_flight.spawn(async move {
                            let Some(response) = router.handle(&query).await else {
                                return;
                            };
                            if let Err(e) = socket.send_to(&response, src).await {
                                debug!(client = %src, error = %e, "Failed to send response");
                            }
                        });
                    }
                    Err(e) => {
                        recv_errors += 1;
                        warn!(error = %e, "UDP recv error");
                        if recv_errors >= MAX_RECV_ERRORS {
                            error!("Too many consecutive receive errors, listener exiting");
                            let _ = faults.send(ServerError::Io(e));
                            break;
                        }
                    }
                }
            }
        }
    }

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = in_flight.len(),
            "In-flight queries did not finish, aborting"
        );
        in_flight.shutdown().await;
    }
}
