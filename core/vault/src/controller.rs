//! Request/response front for the vault, for hosts that talk to the
//! security core over a channel instead of holding it directly.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capsules::{Capsule, CapsuleStore};
use crate::manager::SessionStateManager;
use crate::operations::{ImportSummary, VaultOperations};
use crate::status::VaultStatus;
use memvault_common::{Error, Result, SensitiveBytes, VaultId};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Requests accepted by the controller.
pub enum VaultRequest {
    Status(oneshot::Sender<VaultStatus>),
    Unlock(SensitiveBytes, oneshot::Sender<Result<()>>),
    Lock(oneshot::Sender<Result<()>>),
    InitializeVault(SensitiveBytes, oneshot::Sender<Result<()>>),
    PutCapsule(Capsule, oneshot::Sender<Result<()>>),
    GetCapsule(Uuid, oneshot::Sender<Result<Capsule>>),
    ListCapsules(oneshot::Sender<Result<Vec<Capsule>>>),
    Export(SensitiveBytes, oneshot::Sender<Result<Vec<u8>>>),
    Import(Vec<u8>, SensitiveBytes, oneshot::Sender<Result<ImportSummary>>),
    Shutdown,
}

impl VaultRequest {
    fn name(&self) -> &'static str {
        match self {
            VaultRequest::Status(_) => "status",
            VaultRequest::Unlock(..) => "unlock",
            VaultRequest::Lock(_) => "lock",
            VaultRequest::InitializeVault(..) => "initialize_vault",
            VaultRequest::PutCapsule(..) => "put_capsule",
            VaultRequest::GetCapsule(..) => "get_capsule",
            VaultRequest::ListCapsules(_) => "list_capsules",
            VaultRequest::Export(..) => "export",
            VaultRequest::Import(..) => "import",
            VaultRequest::Shutdown => "shutdown",
        }
    }
}

/// Owns the manager, capsule store and operations, and serves requests.
pub struct VaultController {
    manager: Arc<SessionStateManager>,
    capsules: CapsuleStore,
    operations: VaultOperations,
    request_rx: mpsc::Receiver<VaultRequest>,
}

/// Cloneable handle for sending requests to a running controller.
#[derive(Clone)]
pub struct VaultClient {
    vault_id: VaultId,
    request_tx: mpsc::Sender<VaultRequest>,
}

impl VaultController {
    pub fn new(manager: Arc<SessionStateManager>) -> (Self, VaultClient) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let capsules = CapsuleStore::new(manager.clone());
        let operations = VaultOperations::new(manager.clone(), capsules.clone());

        let client = VaultClient {
            vault_id: manager.config().vault_id.clone(),
            request_tx,
        };
        let controller = Self {
            manager,
            capsules,
            operations,
            request_rx,
        };
        (controller, client)
    }

    /// Serve requests until shut down or every client is dropped.
    ///
    /// Each request runs in its own task, so a slow key derivation never
    /// holds up a status query.
    pub async fn run(mut self) -> Result<()> {
        self.manager.initialize().await?;
        info!(vault = %self.manager.config().vault_id, "Vault controller started");

        let mut events = self.manager.subscribe();
        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let request = match request {
                        Some(VaultRequest::Shutdown) | None => break,
                        Some(request) => request,
                    };
                    debug!(request = request.name(), "Vault request");

                    let manager = self.manager.clone();
                    let capsules = self.capsules.clone();
                    let operations = self.operations.clone();
                    tokio::spawn(async move {
                        Self::handle(manager, capsules, operations, request).await;
                    });
                }
                event = events.recv() => {
                    // Locks from other contexts arrive here as events.
                    if event.is_ok() && !self.manager.is_unlocked() {
                        let purged = self.capsules.purge().await;
                        if purged > 0 {
                            info!(purged, "Capsules purged after lock");
                        }
                    }
                }
            }
        }

        info!("Vault controller stopped");
        Ok(())
    }

    async fn handle(
        manager: Arc<SessionStateManager>,
        capsules: CapsuleStore,
        operations: VaultOperations,
        request: VaultRequest,
    ) {
        // Replies are dropped silently when the caller gave up waiting.
        match request {
            VaultRequest::Status(reply) => {
                let _ = reply.send(manager.get_status().await);
            }
            VaultRequest::Unlock(passphrase, reply) => {
                let _ = reply.send(manager.unlock(&passphrase).await);
            }
            VaultRequest::Lock(reply) => {
                let result = manager.lock().await;
                let purged = capsules.purge().await;
                debug!(purged, "Capsules purged on lock");
                let _ = reply.send(result);
            }
            VaultRequest::InitializeVault(passphrase, reply) => {
                let _ = reply.send(manager.initialize_vault(&passphrase).await);
            }
            VaultRequest::PutCapsule(capsule, reply) => {
                let _ = reply.send(capsules.put(capsule).await);
            }
            VaultRequest::GetCapsule(id, reply) => {
                let _ = reply.send(capsules.get(&id).await);
            }
            VaultRequest::ListCapsules(reply) => {
                let _ = reply.send(capsules.list().await);
            }
            VaultRequest::Export(passphrase, reply) => {
                let _ = reply.send(operations.export(&passphrase).await);
            }
            VaultRequest::Import(bytes, passphrase, reply) => {
                let _ = reply.send(operations.import(&bytes, &passphrase).await);
            }
            VaultRequest::Shutdown => {}
        }
    }
}

impl VaultClient {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> VaultRequest) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::Storage("Vault controller not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Storage("Vault controller dropped the request".to_string()))
    }

    /// Current status. Reports an unavailable vault if the controller is gone.
    pub async fn status(&self) -> VaultStatus {
        match self.call(VaultRequest::Status).await {
            Ok(status) => status,
            Err(e) => VaultStatus::unavailable(self.vault_id.clone(), e.user_message()),
        }
    }

    pub async fn unlock(&self, passphrase: SensitiveBytes) -> Result<()> {
        self.call(|reply| VaultRequest::Unlock(passphrase, reply)).await?
    }

    pub async fn lock(&self) -> Result<()> {
        self.call(VaultRequest::Lock).await?
    }

    pub async fn initialize_vault(&self, passphrase: SensitiveBytes) -> Result<()> {
        self.call(|reply| VaultRequest::InitializeVault(passphrase, reply)).await?
    }

    pub async fn put_capsule(&self, capsule: Capsule) -> Result<()> {
        self.call(|reply| VaultRequest::PutCapsule(capsule, reply)).await?
    }

    pub async fn get_capsule(&self, id: Uuid) -> Result<Capsule> {
        self.call(|reply| VaultRequest::GetCapsule(id, reply)).await?
    }

    pub async fn list_capsules(&self) -> Result<Vec<Capsule>> {
        self.call(VaultRequest::ListCapsules).await?
    }

    pub async fn export(&self, passphrase: SensitiveBytes) -> Result<Vec<u8>> {
        self.call(|reply| VaultRequest::Export(passphrase, reply)).await?
    }

    pub async fn import(&self, bytes: Vec<u8>, passphrase: SensitiveBytes) -> Result<ImportSummary> {
        self.call(|reply| VaultRequest::Import(bytes, passphrase, reply)).await?
    }

    /// Ask the controller to stop accepting requests.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(VaultRequest::Shutdown).await;
    }
}
