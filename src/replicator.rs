use futures::future::join_all;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::postgres::PgConnection;
use crate::snapshot::SnapshotBootstrapper;
use crate::supervisor::StreamSupervisor;
use crate::{Config, Error, Result};

/// Runs one [`StreamSupervisor`] per configured table.
pub struct Replicator {
    config: Config,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Checks that the server is reachable and the dump utility is available,
    /// then streams every table until `shutdown` is cancelled.
    ///
    /// Streams are independent: a stream that fails is logged and the others
    /// keep running.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Replicator starting");

        self.probe().await?;
        let dump_path = self.dump_path()?;

        let tasks: Vec<_> = self
            .config
            .capture
            .tables
            .iter()
            .map(|table| {
                let supervisor = StreamSupervisor::new(
                    &self.config,
                    table.clone(),
                    dump_path.clone(),
                    shutdown.child_token(),
                );
                let slot = supervisor.slot().to_string();
                (slot, tokio::spawn(supervisor.run()))
            })
            .collect();

        let (slots, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let mut failed = 0;
        for (slot, joined) in slots.iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(())) => info!(slot = %slot, "stream finished"),
                Ok(Err(e)) => {
                    failed += 1;
                    error!(slot = %slot, error = %e, "stream failed");
                }
                Err(e) => {
                    failed += 1;
                    error!(slot = %slot, error = %e, "stream task panicked");
                }
            }
        }

        info!(streams = slots.len(), failed, "Replicator stopped");
        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let mut connection = PgConnection::connect(&self.config.postgres).await?;
        let system = connection.identify_system().await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            database = ?system.dbname,
            "connected to PostgreSQL"
        );
        connection.close().await
    }

    fn dump_path(&self) -> Result<Option<PathBuf>> {
        if !self.config.capture.historical {
            return Ok(None);
        }
        let path = SnapshotBootstrapper::resolve_dump_path(self.config.capture.dump_path.as_deref())
            .map_err(|e| Error::Config(format!("historical export enabled but {}", e)))?;
        info!(dump = %path.display(), "historical export enabled");
        Ok(Some(path))
    }
}
