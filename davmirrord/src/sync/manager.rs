use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use url::Url;

use davmirror_core::{Credentials, DavClient, DavError, Multistatus, resource_url};

use super::resource::{Account, ChangeSet};
use super::store::{Store, StoreError};
use super::transfer::{DownloadManager, PasswordProvider};

/// Reconcile failures are broadcast to every coalesced caller, so the error
/// carries owned descriptions rather than source errors.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed remote response: {0}")]
    Protocol(String),
    #[error("remote returned unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("remote requires authentication")]
    AuthenticationRequired,
    #[error("cancelled")]
    Cancelled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<StoreError> for ManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownAccount(_) | StoreError::InvalidArgument(_) => {
                ManagerError::InvalidArgument(err.to_string())
            }
            other => ManagerError::Storage(other.to_string()),
        }
    }
}

impl From<DavError> for ManagerError {
    fn from(err: DavError) -> Self {
        match err {
            DavError::Request(_) => ManagerError::Network(err.to_string()),
            DavError::AuthenticationRequired => ManagerError::AuthenticationRequired,
            DavError::Malformed(_) | DavError::NotFound => ManagerError::Protocol(err.to_string()),
            DavError::UnexpectedStatus(status) => ManagerError::UnexpectedStatus(status.as_u16()),
            DavError::Url(_) | DavError::CannotBeBase => {
                ManagerError::InvalidArgument(err.to_string())
            }
        }
    }
}

pub type UpdateOutcome = Result<ChangeSet, ManagerError>;

/// Drives one account's mirror toward the remote: fetches the properties of
/// a requested path (self plus one level of children), writes the diff into
/// the store, forwards the change set, and hands every non-collection that
/// lacks a current body to the transfer layer. Reconciliation is lazy;
/// discovered child collections are only marked dirty, never walked.
pub struct ResourceManager {
    account: Account,
    store: Arc<Store>,
    client: DavClient,
    transfers: Arc<DownloadManager>,
    passwords: Arc<dyn PasswordProvider>,
    changes: mpsc::UnboundedSender<ChangeSet>,
    inflight: Mutex<HashMap<Vec<String>, Vec<oneshot::Sender<UpdateOutcome>>>>,
    cached_password: std::sync::Mutex<Option<String>>,
}

impl ResourceManager {
    pub fn new(
        account: Account,
        store: Arc<Store>,
        client: DavClient,
        transfers: Arc<DownloadManager>,
        passwords: Arc<dyn PasswordProvider>,
        changes: mpsc::UnboundedSender<ChangeSet>,
    ) -> Self {
        Self {
            account,
            store,
            client,
            transfers,
            passwords,
            changes,
            inflight: Mutex::new(HashMap::new()),
            cached_password: std::sync::Mutex::new(None),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn transfers(&self) -> &Arc<DownloadManager> {
        &self.transfers
    }

    /// Reconciles the subtree rooted at `path`. A second request for the
    /// same path while one is in flight coalesces onto it; every caller
    /// observes the in-flight outcome.
    pub async fn update_resource(&self, path: &[String]) -> UpdateOutcome {
        let key = path.to_vec();
        {
            let mut inflight = self.inflight.lock().await;
            if let Some(waiters) = inflight.get_mut(&key) {
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                drop(inflight);
                return match receiver.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ManagerError::Cancelled),
                };
            }
            inflight.insert(key.clone(), Vec::new());
        }

        let outcome = self.reconcile(path).await;

        let waiters = self
            .inflight
            .lock()
            .await
            .remove(&key)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
        outcome
    }

    async fn reconcile(&self, path: &[String]) -> UpdateOutcome {
        let local = self.store.resource(&self.account.id, path).await?;
        // Unknown nodes are addressed as collections; the remote answers for
        // the actual type either way.
        let collection_hint = local.as_ref().map(|node| node.is_collection).unwrap_or(true);
        let url = resource_url(&self.account.base_url, path, collection_hint)?;

        let changes = match self.fetch_properties(&url).await {
            Ok(listing) => {
                let Multistatus {
                    self_properties,
                    children,
                } = listing;
                let content = self_properties.is_collection.then_some(&children);
                self.store
                    .update(&self.account.id, path, Some(&self_properties), content)
                    .await?
            }
            Err(DavError::NotFound) => {
                self.store
                    .update(&self.account.id, path, None, None)
                    .await?
            }
            Err(err) => return Err(err.into()),
        };

        tracing::debug!(
            account = %self.account.id,
            path = %path.join("/"),
            written = changes.inserted_or_updated.len(),
            deleted = changes.deleted.len(),
            "reconciled"
        );

        if !changes.is_empty() {
            let _ = self.changes.send(changes.clone());
        }
        for resource in &changes.inserted_or_updated {
            if resource.needs_body() {
                self.transfers.download(resource.id.clone());
            }
        }
        Ok(changes)
    }

    /// One attempt without credentials, then at most one retry after asking
    /// the delegate. A password that works is cached for later requests on
    /// this account.
    async fn fetch_properties(&self, url: &Url) -> Result<Multistatus, DavError> {
        let cached = self
            .cached_password
            .lock()
            .expect("password mutex poisoned")
            .clone();
        let credentials = cached.map(|password| Credentials {
            username: self.account.username.clone(),
            password,
        });
        match self
            .client
            .retrieve_properties(url, credentials.as_ref())
            .await
        {
            Err(DavError::AuthenticationRequired) => {
                let Some(password) = self.passwords.password(&self.account).await else {
                    return Err(DavError::AuthenticationRequired);
                };
                let credentials = Credentials {
                    username: self.account.username.clone(),
                    password: password.clone(),
                };
                let result = self
                    .client
                    .retrieve_properties(url, Some(&credentials))
                    .await;
                if result.is_ok() {
                    *self
                        .cached_password
                        .lock()
                        .expect("password mutex poisoned") = Some(password);
                }
                result
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
