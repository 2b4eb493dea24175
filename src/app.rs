use crate::app_state::{Collaborators, VtnState};
use crate::config::{BackupKind, VtnConfig, VtnMode};
use crate::connectors::management::ManagementServer;
use crate::error::{Context, Result};
use crate::protocol::EventPusher;
use crate::registry::{BackupStore, MemoryBackupStore, RedisBackupStore};
use crate::sink::{ForecastReader, PrometheusForecastReader};
use crate::transport::{HttpEventPusher, ProtocolServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct VtnApp {
    state: Arc<VtnState>,
    protocol: ProtocolServer,
    management: ManagementServer,
    shutdown: CancellationToken,
}

async fn open_backup_store(config: &VtnConfig) -> Result<Arc<dyn BackupStore>> {
    match config.backup.kind {
        BackupKind::Redis => {
            let store = RedisBackupStore::connect(&config.backup.url, config.backup.key.clone())
                .await
                .with_context(|| format!("failed to connect to backup store at {}", config.backup.url))?;
            Ok(Arc::new(store))
        }
        BackupKind::Memory => {
            tracing::warn!("using in-memory VEN backup; registrations will not survive a restart");
            Ok(Arc::new(MemoryBackupStore::new()))
        }
    }
}

impl VtnApp {
    pub async fn initialise(config: VtnConfig) -> Result<Self> {
        let store = open_backup_store(&config).await?;

        let forecast = match config.forecast.url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let reader = PrometheusForecastReader::new(url, config.forecast.timeout)
                    .context("failed to construct forecast reader")?;
                Some(Arc::new(reader) as Arc<dyn ForecastReader>)
            }
            _ => None,
        };

        let pusher = match config.mode {
            VtnMode::Push => Some(Arc::new(
                HttpEventPusher::new(PUSH_TIMEOUT).context("failed to construct push client")?,
            ) as Arc<dyn EventPusher>),
            VtnMode::Poll => None,
        };

        let state = VtnState::initialise(
            &config,
            store,
            Collaborators {
                forecast,
                pusher,
                ..Collaborators::default()
            },
        )
        .await
        .context("failed to initialise VTN state")?;

        let protocol = ProtocolServer::new(
            config
                .protocol
                .socket_addr()
                .context("invalid protocol listener address")?,
        );
        let management =
            ManagementServer::build(&config.management).context("failed to construct management server")?;

        Ok(Self {
            state: Arc::new(state),
            protocol,
            management,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> Arc<VtnState> {
        Arc::clone(&self.state)
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            state,
            protocol,
            management,
            shutdown,
        } = self;

        let mut servers = JoinSet::new();
        {
            let state = Arc::clone(&state);
            let shutdown = shutdown.clone();
            servers.spawn(async move { protocol.serve(state, shutdown).await });
        }
        {
            let state = Arc::clone(&state);
            let shutdown = shutdown.clone();
            servers.spawn(async move { management.serve(state, shutdown).await });
        }

        tracing::info!(vtn_id = %state.vtn_id, "VTN ready; press Ctrl+C to stop");

        let mut outcome = Ok(());
        tokio::select! {
            res = servers.join_next() => {
                tracing::warn!("listener task terminated unexpectedly");
                if let Some(res) = res {
                    outcome = match res {
                        Ok(result) => result,
                        Err(join_err) => Err(crate::err!("listener task join error: {join_err}")),
                    };
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }

        let stopped = state.shutdown().await;
        tracing::info!(stopped, "event tasks stopped");
        shutdown.cancel();

        let drain = async {
            while let Some(res) = servers.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "listener stopped with error"),
                    Err(join_err) => tracing::warn!(error = %join_err, "listener task cancelled"),
                }
            }
        };

        if timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::error!(
                timeout_secs = DRAIN_TIMEOUT.as_secs_f64(),
                "listeners did not stop in time; aborting"
            );
            servers.shutdown().await;
        }

        outcome
    }
}
