//! Wiring of the store, the Pipedrive client, the orchestrators, and the
//! CRUD services. The HTTP server and the CLI both work through one
//! [`App`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pipesync_core::store::Store;

use crate::bulk_sync::BulkSync;
use crate::client::PipedriveClient;
use crate::config::Config;
use crate::hub::SyncHub;
use crate::lifecycle::Lifecycle;
use crate::promote::Promoter;
use crate::reconcile::Reconciler;
use crate::replicate::Replicator;
use crate::services::{ActivityService, CampaignService, ContactService, UserService};

pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub reconciler: Arc<Reconciler>,
    pub promoter: Arc<Promoter>,
    pub replicator: Arc<Replicator>,
    pub lifecycle: Lifecycle,
    pub bulk_sync: Arc<BulkSync>,
    pub hub: SyncHub,
    pub contacts: ContactService,
    pub campaigns: CampaignService,
    pub activities: ActivityService,
    pub users: UserService,
}

impl App {
    /// Build everything on top of an opened store.
    ///
    /// A missing default token is not an error here: users may carry
    /// their own token, and calls without one fail as expired credentials.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let token = match config.pipedrive.resolve_token() {
            Some(token) => token,
            None => {
                tracing::warn!(
                    "no default Pipedrive API token configured; only users with their own token can sync"
                );
                String::new()
            }
        };
        let client = PipedriveClient::new(&config.pipedrive, token)?;
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            client,
            config.sanitize.clone(),
        ));
        let promoter = Arc::new(Promoter::new(reconciler.clone(), config.promotion.clone()));
        let replicator = Arc::new(Replicator::new(
            reconciler.clone(),
            config.replication.retry_policy(),
        ));
        let bulk_sync = Arc::new(BulkSync::new(reconciler.clone(), config.sync.clone()));
        let hub = SyncHub::new(
            bulk_sync.clone(),
            Duration::from_secs(config.sync.retain_finished_secs),
        );

        Ok(Self {
            lifecycle: Lifecycle::new(reconciler.clone()),
            contacts: ContactService::new(reconciler.clone(), promoter.clone()),
            campaigns: CampaignService::new(store.clone()),
            activities: ActivityService::new(store.clone(), replicator.clone()),
            users: UserService::new(store.clone()),
            config: Arc::new(config),
            store,
            reconciler,
            promoter,
            replicator,
            bulk_sync,
            hub,
        })
    }
}
