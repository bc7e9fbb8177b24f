pub mod config;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod model;
pub mod mutation;
pub mod reconcile;
pub mod router;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use change_feed::ChangeFeed;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::{ConfigError, ConnectionError, MutationError, SyncError, SyncResult};
pub use ledger::{LedgerEvent, MutationLedger, OperationId};
pub use model::AuthorRef;
pub use mutation::{MutationEndpoint, OptimisticMutations};
pub use router::{FeedListener, FeedType, ThreadListener, TopicRouter};
pub use store::{RecordStore, ThreadStore};

/// The four collaborating components wired together. Built explicitly and
/// passed by reference; nothing here is a process-wide singleton.
pub struct SyncCore {
    config: SyncConfig,
    connection: ConnectionManager,
    router: TopicRouter,
    ledger: MutationLedger,
    mutations: OptimisticMutations,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCore {
    pub fn new(
        mut config: SyncConfig,
        feed: Arc<dyn ChangeFeed>,
        endpoint: Arc<dyn MutationEndpoint>,
        author: AuthorRef,
    ) -> Self {
        if config.router.local_user_id.is_none() && !author.id.is_empty() {
            config.router.local_user_id = Some(author.id.clone());
        }
        let connection = ConnectionManager::from_config(feed, &config);
        let router = TopicRouter::new(connection.clone(), &config.router);
        let ledger = MutationLedger::new(config.ledger.clone());
        let mutations = OptimisticMutations::new(endpoint, ledger.clone(), author);
        Self {
            config,
            connection,
            router,
            ledger,
            mutations,
            sweeper: Mutex::new(None),
        }
    }

    /// Reads `TIDE__*` configuration from the environment.
    pub fn from_env(
        feed: Arc<dyn ChangeFeed>,
        endpoint: Arc<dyn MutationEndpoint>,
        author: AuthorRef,
    ) -> Self {
        Self::new(SyncConfig::from_env(), feed, endpoint, author)
    }

    pub fn init_logging(&self) -> Result<(), telemetry::logging::InitError> {
        telemetry::logging::init(&self.config.log)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn ledger(&self) -> &MutationLedger {
        &self.ledger
    }

    pub fn mutations(&self) -> &OptimisticMutations {
        &self.mutations
    }

    /// Starts the ledger sweeper (once) and connects.
    pub async fn start(&self) -> SyncResult<()> {
        {
            let mut sweeper = self.sweeper.lock();
            if sweeper.is_none() {
                *sweeper = Some(self.ledger.spawn_sweeper());
            }
        }
        self.connection.connect().await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.connection.disconnect();
        info!(target = "tide.connection", "sync core shut down");
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
