use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use url::Url;

use davmirror_core::DavClient;

use crate::config::ServiceConfig;
use crate::sync::manager::{ManagerError, ResourceManager};
use crate::sync::resource::{Account, ChangeSet, Resource};
use crate::sync::session::SessionIdentifier;
use crate::sync::store::{Store, StoreError};
use crate::sync::transfer::{DownloadManager, PasswordProvider, TransferEvent};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Update(#[from] ManagerError),
}

/// The host's end of the engine: asked for credentials whenever a manager or
/// transfer hits an authentication challenge.
#[async_trait::async_trait]
pub trait ServiceDelegate: Send + Sync {
    async fn password_for(&self, account: &Account) -> Option<String>;
}

#[derive(Default)]
struct DelegateSlot {
    inner: RwLock<Option<Arc<dyn ServiceDelegate>>>,
}

#[async_trait::async_trait]
impl PasswordProvider for DelegateSlot {
    async fn password(&self, account: &Account) -> Option<String> {
        let delegate = self.inner.read().expect("delegate lock poisoned").clone();
        match delegate {
            Some(delegate) => delegate.password_for(account).await,
            // No delegate installed resolves as "no credential", which the
            // challenged operation treats as a cancel.
            None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServiceEvent {
    AccountAdded(Account),
    AccountUpdated(Account),
    AccountRemoved(Account),
    AccountsChanged,
    ResourcesChanged(ChangeSet),
}

#[derive(Clone)]
struct AccountRuntime {
    manager: Arc<ResourceManager>,
}

/// Process-wide registry of accounts and their managers. Account CRUD is
/// forwarded to the store; a resource manager (with its download manager) is
/// created lazily on first use per account. Everything observable fans out
/// over one broadcast channel.
pub struct SyncService {
    config: ServiceConfig,
    store: Arc<Store>,
    runtimes: Mutex<HashMap<String, AccountRuntime>>,
    events: broadcast::Sender<ServiceEvent>,
    delegate: Arc<DelegateSlot>,
}

impl SyncService {
    pub async fn open(config: ServiceConfig) -> Result<Self, ServiceError> {
        let store = Arc::new(Store::open(&config.directory).await?);
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            config,
            store,
            runtimes: Mutex::new(HashMap::new()),
            events,
            delegate: Arc::new(DelegateSlot::default()),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn set_delegate(&self, delegate: Arc<dyn ServiceDelegate>) {
        *self.delegate.inner.write().expect("delegate lock poisoned") = Some(delegate);
    }

    pub fn clear_delegate(&self) {
        *self.delegate.inner.write().expect("delegate lock poisoned") = None;
    }

    pub async fn accounts(&self) -> Result<Vec<Account>, ServiceError> {
        Ok(self.store.accounts().await?)
    }

    pub async fn account(&self, id: &str) -> Result<Option<Account>, ServiceError> {
        Ok(self.store.account(id).await?)
    }

    pub async fn add_account(
        &self,
        base_url: &Url,
        username: &str,
    ) -> Result<Account, ServiceError> {
        let account = self.store.add_account(base_url, username).await?;
        tracing::info!(account = %account.id, url = %account.base_url, "account added");
        let _ = self.events.send(ServiceEvent::AccountAdded(account.clone()));
        let _ = self.events.send(ServiceEvent::AccountsChanged);
        Ok(account)
    }

    pub async fn update_account(
        &self,
        id: &str,
        label: Option<&str>,
    ) -> Result<Account, ServiceError> {
        let account = self.store.update_account(id, label).await?;
        let _ = self.events.send(ServiceEvent::AccountUpdated(account.clone()));
        let _ = self.events.send(ServiceEvent::AccountsChanged);
        Ok(account)
    }

    pub async fn remove_account(&self, id: &str) -> Result<(), ServiceError> {
        let removed = self
            .store
            .account(id)
            .await?
            .ok_or_else(|| StoreError::UnknownAccount(id.to_string()))?;
        if let Some(runtime) = self.runtimes.lock().await.remove(id) {
            runtime.manager.transfers().invalidate_and_cancel();
        }
        self.store.remove_account(id).await?;
        tracing::info!(account = %id, "account removed");
        let _ = self.events.send(ServiceEvent::AccountRemoved(removed));
        let _ = self.events.send(ServiceEvent::AccountsChanged);
        Ok(())
    }

    pub async fn resource(
        &self,
        account_id: &str,
        path: &[String],
    ) -> Result<Option<Resource>, ServiceError> {
        Ok(self.store.resource(account_id, path).await?)
    }

    pub async fn contents(
        &self,
        account_id: &str,
        path: &[String],
    ) -> Result<Vec<Resource>, ServiceError> {
        Ok(self.store.contents(account_id, path).await?)
    }

    /// Reconciles the subtree rooted at `path` against the remote.
    pub async fn update_resource(
        &self,
        account_id: &str,
        path: &[String],
    ) -> Result<ChangeSet, ServiceError> {
        let runtime = self.runtime(account_id).await?;
        Ok(runtime.manager.update_resource(path).await?)
    }

    /// One round of background refresh: the account root plus a bounded
    /// batch of collections still marked dirty. Returns how many nodes were
    /// reconciled.
    pub async fn refresh_account(
        &self,
        account_id: &str,
        budget: u32,
    ) -> Result<usize, ServiceError> {
        let runtime = self.runtime(account_id).await?;
        runtime.manager.update_resource(&[]).await?;
        let mut reconciled = 1;
        for collection in self.store.dirty_collections(account_id, budget).await? {
            runtime.manager.update_resource(collection.path()).await?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Routes a host-delivered background session wake-up to the owning
    /// account's transfer layer. Sessions of unknown accounts belong to
    /// sibling processes and are ignored; the completion always fires.
    pub async fn handle_events(&self, identifier: &str, completion: impl FnOnce() + Send + 'static) {
        let Some(session) = SessionIdentifier::decode(identifier) else {
            tracing::debug!(identifier, "ignoring malformed session identifier");
            completion();
            return;
        };
        match self.runtime(&session.account).await {
            Ok(runtime) => runtime
                .manager
                .transfers()
                .handle_events(identifier, completion),
            Err(_) => {
                tracing::debug!(session = %session, "ignoring events for a foreign session");
                completion();
            }
        }
    }

    async fn runtime(&self, account_id: &str) -> Result<AccountRuntime, ServiceError> {
        let mut runtimes = self.runtimes.lock().await;
        if let Some(runtime) = runtimes.get(account_id) {
            return Ok(runtime.clone());
        }
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or_else(|| StoreError::UnknownAccount(account_id.to_string()))?;

        let passwords: Arc<dyn PasswordProvider> = Arc::clone(&self.delegate) as _;
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let transfers = Arc::new(DownloadManager::new(
            account.clone(),
            Arc::clone(&self.store),
            &self.config.bundle_identifier,
            Arc::clone(&passwords),
            transfer_tx,
        ));
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(ResourceManager::new(
            account,
            Arc::clone(&self.store),
            DavClient::new(),
            transfers,
            passwords,
            changes_tx,
        ));
        tokio::spawn(pump_resource_changes(changes_rx, self.events.clone()));
        tokio::spawn(pump_transfer_events(transfer_rx, self.events.clone()));

        let runtime = AccountRuntime { manager };
        runtimes.insert(account_id.to_string(), runtime.clone());
        Ok(runtime)
    }
}

async fn pump_resource_changes(
    mut changes: mpsc::UnboundedReceiver<ChangeSet>,
    events: broadcast::Sender<ServiceEvent>,
) {
    while let Some(changes) = changes.recv().await {
        let _ = events.send(ServiceEvent::ResourcesChanged(changes));
    }
}

async fn pump_transfer_events(
    mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
    events: broadcast::Sender<ServiceEvent>,
) {
    while let Some(event) = transfers.recv().await {
        let changes = match event {
            TransferEvent::Started { changes, .. }
            | TransferEvent::Finished { changes, .. }
            | TransferEvent::Cancelled { changes, .. } => changes,
            TransferEvent::Failed { id, error, changes } => {
                tracing::warn!(id = %id, error = %error, "body download failed");
                changes
            }
        };
        if !changes.is_empty() {
            let _ = events.send(ServiceEvent::ResourcesChanged(changes));
        }
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
