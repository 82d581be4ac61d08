//! Pending file transfers and their completion callbacks

use device_cloud_shared::TransferStatus;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Called once with (client, file name, terminal status)
pub type TransferCallback<C> = Arc<dyn Fn(&C, &str, TransferStatus) + Send + Sync>;

/// Caller-side identity of a transfer: file name plus local path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferIdentity {
    pub name: String,
    pub path: PathBuf,
}

impl TransferIdentity {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for TransferIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Ways to refer to a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKey {
    Identity(TransferIdentity),
    /// Id assigned by the transport
    Id(String),
}

impl From<TransferIdentity> for TransferKey {
    fn from(identity: TransferIdentity) -> Self {
        TransferKey::Identity(identity)
    }
}

impl From<&str> for TransferKey {
    fn from(id: &str) -> Self {
        TransferKey::Id(id.to_string())
    }
}

impl From<String> for TransferKey {
    fn from(id: String) -> Self {
        TransferKey::Id(id)
    }
}

/// A file transfer in flight
pub struct PendingTransfer<C> {
    pub identity: TransferIdentity,
    pub callback: Option<TransferCallback<C>>,
    pub file_id: Option<String>,
    pub checksum: Option<String>,
    pub status: TransferStatus,
}

impl<C> PendingTransfer<C> {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            identity: TransferIdentity::new(name, path),
            callback: None,
            file_id: None,
            checksum: None,
            status: TransferStatus::Pending,
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&C, &str, TransferStatus) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    fn finish(self, client: &C) {
        if let Some(callback) = &self.callback {
            callback(client, &self.identity.name, self.status);
        }
    }
}

impl<C> fmt::Debug for PendingTransfer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTransfer")
            .field("identity", &self.identity)
            .field("file_id", &self.file_id)
            .field("checksum", &self.checksum)
            .field("status", &self.status)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

struct Inner<C> {
    transfers: HashMap<TransferIdentity, PendingTransfer<C>>,
    ids: HashMap<String, TransferIdentity>,
}

impl<C> Inner<C> {
    fn identity_for(&self, key: &TransferKey) -> Option<TransferIdentity> {
        match key {
            TransferKey::Identity(identity) => {
                self.transfers.contains_key(identity).then(|| identity.clone())
            }
            TransferKey::Id(id) => self.ids.get(id).cloned(),
        }
    }

    fn take(&mut self, identity: &TransferIdentity) -> Option<PendingTransfer<C>> {
        let transfer = self.transfers.remove(identity)?;
        if let Some(id) = &transfer.file_id {
            self.ids.remove(id);
        }
        Some(transfer)
    }
}

/// File transfers in flight for one client
pub struct PendingTransferSet<C> {
    inner: Mutex<Inner<C>>,
}

impl<C> Default for PendingTransferSet<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PendingTransferSet<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                transfers: HashMap::new(),
                ids: HashMap::new(),
            }),
        }
    }

    /// Register a transfer; returns false if one with the same identity is in flight
    pub async fn begin(&self, transfer: PendingTransfer<C>) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.transfers.contains_key(&transfer.identity) {
            warn!("[TRANSFER] {} already in progress", transfer.identity);
            return false;
        }

        if let Some(id) = &transfer.file_id {
            inner.ids.insert(id.clone(), transfer.identity.clone());
        }
        info!("[TRANSFER] Started {}", transfer.identity);
        inner.transfers.insert(transfer.identity.clone(), transfer);
        true
    }

    /// Record the transport-assigned id (and checksum) for a transfer
    pub async fn assign_id(
        &self,
        identity: &TransferIdentity,
        file_id: impl Into<String>,
        checksum: Option<String>,
    ) -> bool {
        let file_id = file_id.into();
        let mut inner = self.inner.lock().await;

        let Some(transfer) = inner.transfers.get_mut(identity) else {
            return false;
        };
        let previous = transfer.file_id.replace(file_id.clone());
        if checksum.is_some() {
            transfer.checksum = checksum;
        }

        if let Some(previous) = previous {
            inner.ids.remove(&previous);
        }
        inner.ids.insert(file_id, identity.clone());
        true
    }

    /// Set a transfer's status, running its callback if the status is terminal
    ///
    /// Only the first terminal completion fires the callback; later calls for
    /// the same transfer find nothing and return false.
    pub async fn complete(&self, client: &C, key: impl Into<TransferKey>, status: TransferStatus) -> bool {
        let key = key.into();

        let transfer = {
            let mut inner = self.inner.lock().await;
            let Some(identity) = inner.identity_for(&key) else {
                debug!("[TRANSFER] Completion for unknown transfer {:?}", key);
                return false;
            };

            if !status.is_terminal() {
                if let Some(transfer) = inner.transfers.get_mut(&identity) {
                    transfer.status = status;
                }
                return false;
            }

            inner.take(&identity)
        };

        let Some(mut transfer) = transfer else {
            return false;
        };
        transfer.status = status;
        info!("[TRANSFER] {} finished: {}", transfer.identity, status);
        transfer.finish(client);
        true
    }

    pub async fn status(&self, key: impl Into<TransferKey>) -> Option<TransferStatus> {
        let key = key.into();
        let inner = self.inner.lock().await;
        let identity = inner.identity_for(&key)?;
        inner.transfers.get(&identity).map(|t| t.status)
    }

    pub async fn checksum(&self, key: impl Into<TransferKey>) -> Option<String> {
        let key = key.into();
        let inner = self.inner.lock().await;
        let identity = inner.identity_for(&key)?;
        inner.transfers.get(&identity)?.checksum.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.transfers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.transfers.is_empty()
    }

    /// Fail every transfer still in flight, firing each callback once
    pub async fn abort_all(&self, client: &C) -> usize {
        let aborted: Vec<PendingTransfer<C>> = {
            let mut inner = self.inner.lock().await;
            inner.ids.clear();
            inner.transfers.drain().map(|(_, t)| t).collect()
        };

        let count = aborted.len();
        for mut transfer in aborted {
            transfer.status = TransferStatus::Failure;
            warn!("[TRANSFER] Aborted {}", transfer.identity);
            transfer.finish(client);
        }
        count
    }
}
