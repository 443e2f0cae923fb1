//! Engine lifecycle: wire the core components together, bind both listeners,
//! run periodic maintenance, and shut everything down in order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stagehand_core::builder::ArchiveBuilder;
use stagehand_core::command::CommandExecutor;
use stagehand_core::index::ContentIndex;
use stagehand_core::session::SessionManager;
use stagehand_core::stage::Stager;
use stagehand_core::store::{BlobStore, DiskBlobStore, MemoryBlobStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control;
use crate::transport::{self, TransportSettings};

/// How often dead revisions, orphaned blobs and stale archives are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub struct Engine {
    stager: Arc<Stager>,
    sessions: Arc<SessionManager>,
    executor: CommandExecutor,
    stream_addr: SocketAddr,
    control_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build the engine from `config` and start serving.
    pub async fn start(config: Config) -> anyhow::Result<Engine> {
        config.validate()?;
        let store: Arc<dyn BlobStore> = match &config.blob_dir {
            Some(dir) => Arc::new(
                DiskBlobStore::open(dir)
                    .with_context(|| format!("opening blob store at {}", dir.display()))?,
            ),
            None => Arc::new(MemoryBlobStore::new()),
        };
        if let Some(dir) = &config.cache_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating archive cache {}", dir.display()))?;
        }
        let index = Arc::new(ContentIndex::new());
        let builder = Arc::new(ArchiveBuilder::new(store.clone(), config.builder_config()));
        let stager = Arc::new(Stager::new(&config.cook_root, store.clone(), index.clone()));
        let sessions = Arc::new(SessionManager::new(
            index,
            builder,
            store,
            config.session_config(),
        ));
        let executor = CommandExecutor::new(stager.clone(), sessions.clone());

        let stream_listener = TcpListener::bind((config.bind_addr.as_str(), config.stream_port))
            .await
            .with_context(|| format!("binding stream port {}", config.stream_port))?;
        let control_listener = TcpListener::bind((config.bind_addr.as_str(), config.control_port))
            .await
            .with_context(|| format!("binding control port {}", config.control_port))?;
        let stream_addr = stream_listener.local_addr()?;
        let control_addr = control_listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let settings = TransportSettings {
            idle_timeout: config.idle_timeout(),
            ack_timeout: config.ack_timeout(),
        };
        let tasks = vec![
            tokio::spawn(transport::serve(
                stream_listener,
                sessions.clone(),
                settings,
                shutdown.clone(),
            )),
            tokio::spawn(control::serve(
                control_listener,
                executor.clone(),
                shutdown.clone(),
            )),
            tokio::spawn(maintenance(
                stager.clone(),
                sessions.clone(),
                config.archive_grace(),
                shutdown.clone(),
            )),
        ];
        info!(
            %stream_addr,
            %control_addr,
            cook_root = %config.cook_root.display(),
            "stagehand started"
        );
        Ok(Engine {
            stager,
            sessions,
            executor,
            stream_addr,
            control_addr,
            shutdown,
            tasks,
        })
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.stream_addr
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn stager(&self) -> &Arc<Stager> {
        &self.stager
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Stop accepting, close every session, cancel in-flight builds, and wait
    /// for the listener and maintenance tasks to exit.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.sessions.close_all();
        self.sessions.builder().shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("stagehand stopped");
    }
}

async fn maintenance(
    stager: Arc<Stager>,
    sessions: Arc<SessionManager>,
    grace: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let evicted = sessions.builder().evict_unreferenced(sessions.index(), grace);
        // Sweeping waits for any in-progress stage, so keep it off the async workers.
        let sweeper = stager.clone();
        let gc = match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
            Ok(gc) => gc,
            Err(e) => {
                warn!(error = %e, "blob sweep failed");
                continue;
            }
        };
        if evicted > 0 || !gc.dropped_revisions.is_empty() {
            debug!(
                evicted_archives = evicted,
                dropped_revisions = gc.dropped_revisions.len(),
                orphaned_blobs = gc.orphaned.len(),
                "maintenance pass"
            );
        }
    }
}
