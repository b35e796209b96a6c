// Component wiring
// One instance per process; every surface talks to the same components

use anyhow::Result;
use std::sync::Arc;

use crate::auth::{AuthManager, CredentialStore};
use crate::clippings::ClipService;
use crate::config::Config;
use crate::http_client::ApiClient;
use crate::network::NetworkMonitor;
use crate::queue::OfflineQueue;
use crate::scheduler::BackgroundScheduler;
use crate::storage::KeyValueStore;
use crate::sync::SyncReconciler;

/// The sync core for one background context
pub struct SyncContext {
    pub config: Config,
    pub storage: Arc<dyn KeyValueStore>,
    pub network: NetworkMonitor,
    pub credentials: CredentialStore,
    pub auth: Arc<AuthManager>,
    pub api: Arc<ApiClient>,
    pub queue: Arc<OfflineQueue>,
    pub reconciler: Arc<SyncReconciler>,
    pub clips: Arc<ClipService>,
    pub scheduler: Arc<BackgroundScheduler>,
}

impl SyncContext {
    pub fn new(config: Config, storage: Arc<dyn KeyValueStore>) -> Result<Arc<Self>> {
        let network = NetworkMonitor::new();
        let credentials = CredentialStore::new(storage.clone());

        let auth = Arc::new(AuthManager::new(
            credentials.clone(),
            network.clone(),
            &config,
        )?);
        let api = Arc::new(ApiClient::new(auth.clone(), network.clone(), &config)?);
        let queue = Arc::new(OfflineQueue::new(storage.clone()));

        let reconciler = Arc::new(SyncReconciler::new(
            api.clone(),
            auth.clone(),
            queue.clone(),
            network.clone(),
            &config,
        ));
        let clips = Arc::new(ClipService::new(
            api.clone(),
            auth.clone(),
            queue.clone(),
            network.clone(),
        ));
        let scheduler = Arc::new(BackgroundScheduler::new(
            auth.clone(),
            reconciler.clone(),
            network.clone(),
            &config,
        ));

        Ok(Arc::new(Self {
            config,
            storage,
            network,
            credentials,
            auth,
            api,
            queue,
            reconciler,
            clips,
            scheduler,
        }))
    }
}
