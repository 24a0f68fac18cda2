//! Daemon lifecycle management.
//!
//! Wires the components together and supervises them: the template source
//! feeds the job builder, the builder feeds the job buffer and the session
//! registry, sessions feed the validator, and the validator feeds the block
//! submitter and the recorder. One cancellation token fans shutdown out to
//! every task; a task tracker waits for them on the way down.
//!
//! Startup is deliberately strict: an unreadable config, an unreachable
//! node, or a busy listen port abort with an error before any task spawns.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::job::{JobBuffer, JobBuilder};
use crate::persistence::{Record, Recorder};
use crate::stratum::{SessionRegistry, SessionSettings, StratumServer};
use crate::submitter::BlockSubmitter;
use crate::template::rpc::CoreRpcClient;
use crate::template::{TemplateSource, TemplateUpdate};
use crate::tracing::prelude::*;
use crate::validator::{BlockSubmission, ShareValidator};

/// How long queued writes get to drain after shutdown is requested.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// How often the monitor logs registry stats.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Sessions silent for this long are disconnected.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// The main daemon.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the pool until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let rpc = Arc::new(CoreRpcClient::new(&self.config.rpc)?);
        let jobs = Arc::new(JobBuffer::new());
        let registry = Arc::new(SessionRegistry::new(self.config.stratum.difficulty));

        let (update_tx, update_rx) = mpsc::channel::<TemplateUpdate>(8);
        let (submit_tx, submit_rx) = mpsc::channel::<BlockSubmission>(8);
        let (record_tx, record_rx) = mpsc::channel::<Record>(256);

        let validator = Arc::new(ShareValidator::new(
            jobs.clone(),
            submit_tx,
            record_tx.clone(),
        ));

        // A node we cannot reach at startup is a configuration problem,
        // not something to retry behind the operator's back.
        let mut source = TemplateSource::new(
            rpc.clone(),
            self.config.zmq.endpoint.clone(),
            update_tx,
            self.shutdown.clone(),
        );
        source.bootstrap().await?;

        let settings = Arc::new(SessionSettings {
            network: self.config.network.to_network(),
            initial_difficulty: self.config.stratum.difficulty,
            accept_suggested_difficulty: self.config.stratum.accept_suggested_difficulty,
            version_rolling_mask: self.config.stratum.version_rolling_mask,
        });

        let server = StratumServer::bind(
            &self.config.stratum.host,
            self.config.stratum.port,
            self.config.stratum.max_connections,
            registry.clone(),
            jobs.clone(),
            validator,
            settings,
        )
        .await?;

        self.tracker.spawn(source.run());
        self.tracker.spawn(job_builder_task(
            update_rx,
            jobs,
            registry.clone(),
            self.shutdown.clone(),
        ));
        self.tracker.spawn(
            BlockSubmitter::new(rpc, submit_rx, record_tx, self.shutdown.clone()).run(),
        );
        self.tracker
            .spawn(Recorder::new(self.config.data.dir.clone(), record_rx).run());
        self.tracker.spawn(monitor_task(
            registry.clone(),
            self.shutdown.clone(),
        ));
        self.tracker
            .spawn(server.run(self.tracker.clone(), self.shutdown.clone()));
        self.tracker.close();

        info!("Started.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = self.shutdown.cancelled() => {}
        }

        // Courteous close first so client.reconnect still drains, then
        // cancel everything.
        registry.shutdown_all();
        self.shutdown.cancel();

        if tokio::time::timeout(SHUTDOWN_DRAIN, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Some tasks did not finish within the drain deadline");
        }

        info!("Exiting.");
        Ok(())
    }
}

/// Turn template updates into numbered jobs and fan them out.
///
/// The buffer is updated before the broadcast: a miner that answers a
/// notify instantly must find its job already addressable.
async fn job_builder_task(
    mut update_rx: mpsc::Receiver<TemplateUpdate>,
    jobs: Arc<JobBuffer>,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) {
    let mut builder = JobBuilder::new();

    loop {
        tokio::select! {
            update = update_rx.recv() => {
                let Some(update) = update else { return };

                let job = Arc::new(builder.build(&update));
                info!(
                    job = %job.job_id,
                    height = job.template.height,
                    clean = job.clean_jobs,
                    "Broadcasting job"
                );

                jobs.insert(job.clone());
                registry.broadcast_job(&job);
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Periodic stats log and idle-session sweep.
async fn monitor_task(registry: Arc<SessionRegistry>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(MONITOR_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let stats = registry.snapshot_stats();
                info!(
                    connections = stats.connections,
                    authorized = stats.authorized,
                    workers = stats.workers,
                    "Session stats"
                );

                registry.close_idle(IDLE_TIMEOUT);
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
