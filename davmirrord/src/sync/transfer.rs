use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use davmirror_core::{normalize_etag, resource_url};

use super::resource::{Account, ChangeSet, ResourceID};
use super::session::SessionIdentifier;
use super::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("response carries no validator (etag)")]
    MissingValidator,
    #[error("remote returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("remote requires authentication")]
    AuthenticationRequired,
    #[error("cancelled")]
    Cancelled,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Resolves a credential challenge for an account. Answering `None` declines
/// the challenge and cancels the operation that raised it.
#[async_trait::async_trait]
pub trait PasswordProvider: Send + Sync {
    async fn password(&self, account: &Account) -> Option<String>;
}

/// Lifecycle notifications for one account's transfers. Every variant
/// carries the change set of the store transition it caused, so the facade
/// can fan resource changes out without reaching back into the store.
#[derive(Debug)]
pub enum TransferEvent {
    Started {
        id: ResourceID,
        changes: ChangeSet,
    },
    Finished {
        id: ResourceID,
        changes: ChangeSet,
    },
    Failed {
        id: ResourceID,
        error: TransferError,
        changes: ChangeSet,
    },
    Cancelled {
        id: ResourceID,
        changes: ChangeSet,
    },
}

/// Immutable handle onto one in-flight transfer: byte counters plus a
/// cancellation hook that synchronously drives the transfer to a cancelled
/// completion.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    completed: AtomicU64,
    token: CancellationToken,
}

impl Progress {
    pub fn total(&self) -> Option<u64> {
        let total = self.total.load(Ordering::Relaxed);
        (total > 0).then_some(total)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    fn add_completed(&self, amount: u64) {
        self.completed.fetch_add(amount, Ordering::Relaxed);
    }

    async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

struct PendingDownload {
    progress: Arc<Progress>,
}

/// Owns every in-flight body download for one account, keyed by resource
/// identity with at most one transfer per key. Bodies stream into the
/// store's staging directory; only [`Store::move_file`] touches the body
/// cache itself.
pub struct DownloadManager {
    account: Account,
    session: SessionIdentifier,
    store: Arc<Store>,
    http: Client,
    staging: PathBuf,
    passwords: Arc<dyn PasswordProvider>,
    events: mpsc::UnboundedSender<TransferEvent>,
    pending: Arc<Mutex<HashMap<ResourceID, PendingDownload>>>,
    draining: AtomicBool,
}

impl DownloadManager {
    pub fn new(
        account: Account,
        store: Arc<Store>,
        bundle_identifier: &str,
        passwords: Arc<dyn PasswordProvider>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        let session = SessionIdentifier::new(&account.id, bundle_identifier);
        let staging = store.staging_dir(&account.id);
        // Foreground transfers die with the process, so a fresh manager has
        // no pre-existing session tasks to resurrect.
        Self {
            account,
            session,
            store,
            http: Client::new(),
            staging,
            passwords,
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
            draining: AtomicBool::new(false),
        }
    }

    pub fn session_identifier(&self) -> String {
        self.session.encode()
    }

    /// Requests the body of `id`. A duplicate request while one is pending
    /// is ignored, as is any request after invalidation.
    pub fn download(&self, id: ResourceID) {
        if id.account != self.account.id {
            tracing::warn!(id = %id, account = %self.account.id, "download dispatched to the wrong account");
            return;
        }
        if self.draining.load(Ordering::SeqCst) {
            return;
        }
        let progress = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            if pending.contains_key(&id) {
                return;
            }
            let progress = Arc::new(Progress::default());
            pending.insert(
                id.clone(),
                PendingDownload {
                    progress: Arc::clone(&progress),
                },
            );
            progress
        };
        let worker = DownloadWorker {
            account: self.account.clone(),
            store: Arc::clone(&self.store),
            http: self.http.clone(),
            staging: self.staging.clone(),
            passwords: Arc::clone(&self.passwords),
            events: self.events.clone(),
            pending: Arc::clone(&self.pending),
            id,
            progress,
        };
        tokio::spawn(worker.run());
    }

    pub fn progress(&self, id: &ResourceID) -> Option<Arc<Progress>> {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .get(id)
            .map(|pending| Arc::clone(&pending.progress))
    }

    /// Lets in-flight transfers run to completion but accepts no new ones.
    pub fn finish_tasks_and_invalidate(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Cancels every pending transfer; each reports a cancelled completion.
    pub fn invalidate_and_cancel(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let pending = self.pending.lock().expect("pending mutex poisoned");
        for download in pending.values() {
            download.progress.cancel();
        }
    }

    /// Re-attach point for a host-supplied background session. Foreground
    /// transfers leave nothing to drain, so this validates the identifier
    /// and completes immediately; foreign and malformed identifiers are
    /// ignored silently.
    pub fn handle_events(&self, identifier: &str, completion: impl FnOnce()) {
        match SessionIdentifier::decode(identifier) {
            Some(session) if session == self.session => {}
            Some(foreign) => {
                tracing::debug!(session = %foreign, "ignoring events for a foreign session");
            }
            None => {
                tracing::debug!(identifier, "ignoring malformed session identifier");
            }
        }
        completion();
    }
}

struct DownloadWorker {
    account: Account,
    store: Arc<Store>,
    http: Client,
    staging: PathBuf,
    passwords: Arc<dyn PasswordProvider>,
    events: mpsc::UnboundedSender<TransferEvent>,
    pending: Arc<Mutex<HashMap<ResourceID, PendingDownload>>>,
    id: ResourceID,
    progress: Arc<Progress>,
}

impl DownloadWorker {
    async fn run(self) {
        let outcome = self.execute().await;
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&self.id);
        let event = match outcome {
            Ok(changes) => TransferEvent::Finished {
                id: self.id.clone(),
                changes,
            },
            Err(TransferError::Cancelled) => TransferEvent::Cancelled {
                id: self.id.clone(),
                changes: self.abandon().await,
            },
            Err(error) => {
                tracing::warn!(id = %self.id, error = %error, "download failed");
                TransferEvent::Failed {
                    id: self.id.clone(),
                    error,
                    changes: self.abandon().await,
                }
            }
        };
        let _ = self.events.send(event);
    }

    async fn execute(&self) -> Result<ChangeSet, TransferError> {
        let started = self.store.set_downloading(&self.id).await?;
        let _ = self.events.send(TransferEvent::Started {
            id: self.id.clone(),
            changes: started,
        });

        let Some(resource) = self.store.resource(&self.id.account, &self.id.path).await? else {
            return Err(TransferError::InvalidArgument(
                "resource is not in the store".into(),
            ));
        };
        if resource.is_collection {
            return Err(TransferError::InvalidArgument(
                "collections have no body".into(),
            ));
        }
        let url = resource_url(&self.account.base_url, &self.id.path, false)
            .map_err(|err| TransferError::InvalidArgument(err.to_string()))?;

        let response = self.fetch(&url).await?;
        match response.status() {
            StatusCode::OK => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(normalize_etag);
                let Some(etag) = etag else {
                    return Err(TransferError::MissingValidator);
                };

                let temp = self.staging.join(format!("{}.partial", Uuid::new_v4()));
                if let Err(err) = self.stream_to(response, &temp).await {
                    let _ = tokio::fs::remove_file(&temp).await;
                    return Err(err);
                }

                let changes = self.store.move_file(&temp, &etag, &self.id).await?;
                if changes.is_empty() {
                    // The resource moved on while the body was in flight;
                    // the adoption was discarded.
                    return Ok(self.store.clear_downloading(&self.id).await?);
                }
                Ok(changes)
            }
            status => Err(TransferError::UnexpectedStatus(status)),
        }
    }

    async fn fetch(&self, url: &Url) -> Result<reqwest::Response, TransferError> {
        let first = self.send(url, None).await?;
        if first.status() != StatusCode::UNAUTHORIZED {
            return Ok(first);
        }
        let Some(password) = self.passwords.password(&self.account).await else {
            // The delegate declined the challenge.
            return Err(TransferError::Cancelled);
        };
        let second = self.send(url, Some(&password)).await?;
        if second.status() == StatusCode::UNAUTHORIZED {
            return Err(TransferError::AuthenticationRequired);
        }
        Ok(second)
    }

    async fn send(
        &self,
        url: &Url,
        password: Option<&str>,
    ) -> Result<reqwest::Response, TransferError> {
        let mut request = self.http.get(url.clone());
        if let Some(password) = password {
            request = request.basic_auth(&self.account.username, Some(password));
        }
        tokio::select! {
            response = request.send() => Ok(response?),
            _ = self.progress.cancelled() => Err(TransferError::Cancelled),
        }
    }

    async fn stream_to(
        &self,
        response: reqwest::Response,
        target: &Path,
    ) -> Result<(), TransferError> {
        if let Some(total) = response.content_length() {
            self.progress.set_total(total);
        }
        tokio::fs::create_dir_all(&self.staging).await?;
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        let chunk = chunk?;
                        file.write_all(&chunk).await?;
                        self.progress.add_completed(chunk.len() as u64);
                    }
                    None => break,
                },
                _ = self.progress.cancelled() => return Err(TransferError::Cancelled),
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn abandon(&self) -> ChangeSet {
        self.store
            .clear_downloading(&self.id)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(id = %self.id, error = %err, "failed to reset abandoned download");
                ChangeSet::default()
            })
    }
}
