//! Reload supervisor.
//!
//! Owns the config, the rule set and the single live [`DnsServer`], and drives
//! them through this state machine:
//!
//! ```text
//! Starting ──▶ Running ◀──▶ ReloadCheck
//!    │            │
//!    │            ├── shutdown ──▶ Stopping ──▶ Stopped
//!    │            │
//!    └────────────┴── fatal ────▶ Aborting
//! ```
//!
//! All transitions happen on the task calling [`Supervisor::run`]. The server's
//! listener runs on its own task and only ever reports back through the fault
//! channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{modified_time, Config};
use crate::error::{ConfigError, ServerError, SupervisorError};
use crate::metrics::{self, ReloadKind};
use crate::rules::RuleSet;
use crate::server::DnsServer;
use crate::trigger::{Dispatcher, LifecycleState};

/// What woke the supervisor up.
enum Wake {
    Shutdown,
    Fault(ServerError),
    Tick,
}

/// State owned by the supervisor between transitions.
struct Active {
    config: Arc<Config>,
    config_mtime: SystemTime,
    rules: Arc<RuleSet>,
    rules_mtime: Option<SystemTime>,
    server: DnsServer,
    faults: mpsc::UnboundedReceiver<ServerError>,
}

/// Top-level control loop.
pub struct Supervisor {
    config_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor for the config file at `config_path`.
    ///
    /// Cancelling `shutdown` stops the server, fires `stop` and makes [`run`](Self::run) return.
    pub fn new(
        config_path: impl Into<PathBuf>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            dispatcher,
            shutdown,
        }
    }

    /// Run until shutdown is requested or a fatal error occurs.
    ///
    /// `Ok` means a clean shutdown. Any error means the process should exit non-zero.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let mut active = self.starting().await?;

        loop {
            match self.wait(&mut active).await {
                Wake::Shutdown => return self.stopping(active).await,
                Wake::Fault(e) => {
                    return self.aborting(active, SupervisorError::Fault(e)).await;
                }
                Wake::Tick => {
                    if let Err(e) = self.reload_check(&mut active).await {
                        return self.aborting(active, e).await;
                    }
                }
            }
        }
    }

    async fn starting(&self) -> Result<Active, SupervisorError> {
        info!(path = %self.config_path.display(), "Loading config");
        let config = Arc::new(Config::load(&self.config_path).await?);
        let config_mtime = modified_time(&self.config_path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.config_path.clone(),
                source,
            })?;

        let (rules, rules_mtime) = load_rules(&config.rules).await;

        let (server, faults) = match self.start_server(&config, &rules).await {
            Ok(started) => started,
            Err(e) => {
                error!(error = %e, "Error while starting server");
                self.dispatcher
                    .dispatch_lifecycle(&config, LifecycleState::Stop)
                    .await;
                return Err(e.into());
            }
        };

        self.dispatcher
            .dispatch_lifecycle(&config, LifecycleState::Start)
            .await;

        Ok(Active {
            config,
            config_mtime,
            rules,
            rules_mtime,
            server,
            faults,
        })
    }

    async fn wait(&self, active: &mut Active) -> Wake {
        let interval = active.config.reload;
        let tick = async {
            if interval.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(interval).await
            }
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Wake::Shutdown,
            Some(e) = active.faults.recv() => Wake::Fault(e),
            _ = tick => Wake::Tick,
        }
    }

    /// One reload tick. Errors returned here are fatal.
    async fn reload_check(&self, active: &mut Active) -> Result<(), SupervisorError> {
        let config_mtime = match modified_time(&self.config_path).await {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Error while checking config modification time"
                );
                return Ok(());
            }
        };
        let config_changed = config_mtime != active.config_mtime;

        if config_changed {
            info!(path = %self.config_path.display(), "Reloading config");
            let config = Arc::new(Config::load(&self.config_path).await?);

            active.server.stop().await?;
            self.dispatcher
                .dispatch_lifecycle(&active.config, LifecycleState::PartialStop)
                .await;

            active.config = config;
            active.config_mtime = config_mtime;
            metrics::record_reload(ReloadKind::Config);
        }

        let rules_mtime = match modified_time(&active.config.rules).await {
            Ok(mtime) => Some(mtime),
            Err(e) => {
                warn!(
                    path = %active.config.rules.display(),
                    error = %e,
                    "Error while checking rules modification time"
                );
                None
            }
        };

        if config_changed || rules_mtime != active.rules_mtime {
            let (rules, _) = load_rules(&active.config.rules).await;
            active.rules = rules;
            active.rules_mtime = rules_mtime;
            metrics::record_reload(ReloadKind::Rules);

            // After a config change the old server is already stopped; the new
            // one picks the rules up at construction.
            if !config_changed {
                active.server.set_rules(active.rules.clone());
            }
        }

        if config_changed {
            let (server, faults) = self.start_server(&active.config, &active.rules).await?;
            active.server = server;
            active.faults = faults;

            self.dispatcher
                .dispatch_lifecycle(&active.config, LifecycleState::PartialStart)
                .await;
        }

        Ok(())
    }

    async fn stopping(&self, active: Active) -> Result<(), SupervisorError> {
        info!("Shutting down");
        if let Err(e) = active.server.stop().await {
            error!(error = %e, "Error while stopping server");
            return Err(e.into());
        }

        self.dispatcher
            .dispatch_lifecycle(&active.config, LifecycleState::Stop)
            .await;
        Ok(())
    }

    async fn aborting(&self, active: Active, err: SupervisorError) -> Result<(), SupervisorError> {
        error!(error = %err, "Fatal error, aborting");

        match active.server.stop().await {
            Ok(()) | Err(ServerError::NotRunning) => {}
            Err(e) => warn!(error = %e, "Error while stopping server"),
        }

        self.dispatcher
            .dispatch_lifecycle(&active.config, LifecycleState::Stop)
            .await;
        Err(err)
    }

    async fn start_server(
        &self,
        config: &Arc<Config>,
        rules: &Arc<RuleSet>,
    ) -> Result<(DnsServer, mpsc::UnboundedReceiver<ServerError>), ServerError> {
        let server = DnsServer::new(config.clone(), rules.clone(), self.dispatcher.clone());
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        server.start(faults_tx).await?;
        Ok((server, faults_rx))
    }
}

/// Load the rule set, falling back to no rules on any error.
///
/// Returns the modification time observed before reading.
async fn load_rules(path: &Path) -> (Arc<RuleSet>, Option<SystemTime>) {
    info!(path = %path.display(), "Loading rules");
    let mtime = modified_time(path).await.ok();

    let rules = match RuleSet::load(path).await {
        Ok(rules) => {
            info!(count = rules.len(), "Rules loaded");
            rules
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error while reading rules, continuing without rules");
            RuleSet::default()
        }
    };

    metrics::record_rules_loaded(rules.len());
    (Arc::new(rules), mtime)
}

/// Cancel `token` on SIGINT or SIGTERM.
pub fn cancel_on_signals(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
        token.cancel();
    });
}

