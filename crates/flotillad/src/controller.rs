//! Controller wiring: store, feed, dispatcher and router, served until
//! shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use flotilla_api::{ApiState, build_router};
use flotilla_cluster::{ClusterView, HttpCluster};
use flotilla_core::ControllerConfig;
use flotilla_dispatch::JobDispatcher;
use flotilla_feed::FormationFeed;
use flotilla_state::StateStore;

const DB_FILE: &str = "flotilla.redb";

pub struct Controller {
    feed: FormationFeed,
    router: Router,
}

impl Controller {
    /// Open the store and connect to the configured hosts.
    pub fn open(config: &ControllerConfig, in_memory: bool) -> anyhow::Result<Self> {
        let store = if in_memory {
            let store = StateStore::open_in_memory()?;
            info!("in-memory state store opened");
            store
        } else {
            std::fs::create_dir_all(&config.server.data_dir)?;
            let path = config.server.data_dir.join(DB_FILE);
            let store = StateStore::open(&path)?;
            info!(path = ?path, "state store opened");
            store
        };

        let cluster = HttpCluster::new(config.hosts.iter().cloned());
        info!(hosts = config.hosts.len(), "cluster configured");
        Ok(Self::with_cluster(config, store, Arc::new(cluster)))
    }

    pub fn with_cluster(
        config: &ControllerConfig,
        store: StateStore,
        cluster: Arc<dyn ClusterView>,
    ) -> Self {
        let feed = FormationFeed::new(store.clone(), config.feed.subscriber_buffer);
        let dispatcher = JobDispatcher::new(store.clone(), cluster);
        let router = build_router(ApiState {
            store,
            feed: feed.clone(),
            dispatcher,
        });
        Self { feed, router }
    }

    /// Serve on `0.0.0.0:port` until Ctrl-C.
    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, ctrl_c()).await
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// On shutdown the formation feed is closed first so open formation
    /// streams end and in-flight requests can drain.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "API server starting");

        let feed = self.feed;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("shutdown signal received");
                feed.close();
            })
            .await?;
        Ok(())
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler, running until killed");
        std::future::pending::<()>().await;
    }
}
