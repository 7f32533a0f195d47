//! Pending request store.
//!
//! Records requests that await a response so they can be correlated,
//! listed per account and resumed after a restart. `put` is idempotent and
//! `remove` is an atomic take: of two concurrent removals of the same id,
//! exactly one gets the entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Account, AuthKitError, Result, RpcId, Topic};

/// Which side issued the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from a peer; awaiting our respond/reject.
    Incoming,
    /// Sent by us; awaiting the peer's response.
    Outgoing,
}

/// A request awaiting a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: RpcId,
    /// Owning account, when the request is scoped to one.
    #[serde(default)]
    pub account: Option<Account>,
    /// Topic the request arrived on (incoming) or was published to (outgoing).
    pub topic: Topic,
    pub method: String,
    pub direction: Direction,
    pub created_at: i64,
    /// Unix seconds after which a late response is discarded.
    pub expiry: i64,
    /// Request params as sent on the wire.
    pub params: Value,
    /// Decoded result, filled once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl PendingRequest {
    pub fn new(
        id: RpcId,
        topic: Topic,
        method: impl Into<String>,
        direction: Direction,
        params: Value,
        ttl_secs: i64,
    ) -> Self {
        let created_at = crate::unix_now();
        Self {
            id,
            account: None,
            topic,
            method: method.into(),
            direction,
            created_at,
            expiry: created_at + ttl_secs,
            params,
            result: None,
        }
    }

    pub fn with_account(mut self, account: Account) -> Self {
        self.account = Some(account);
        self
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry <= now
    }

    /// True if the entry belongs to `account` or to no account at all.
    pub fn visible_to(&self, account: &Account) -> bool {
        self.account.as_ref().map_or(true, |a| a == account)
    }
}

/// Storage for pending requests.
#[async_trait]
pub trait PendingRequestStore: Send + Sync {
    /// Insert unless an entry with the same id exists. Returns `true` if inserted.
    async fn put(&self, request: PendingRequest) -> Result<bool>;

    async fn get(&self, id: RpcId) -> Result<Option<PendingRequest>>;

    /// Remove and return the entry.
    async fn remove(&self, id: RpcId) -> Result<Option<PendingRequest>>;

    /// Entries visible to `account` (its own plus unscoped ones), oldest first.
    async fn list(&self, account: &Account) -> Result<Vec<PendingRequest>>;

    /// Every entry, oldest first.
    async fn list_all(&self) -> Result<Vec<PendingRequest>>;
}

fn sorted(mut requests: Vec<PendingRequest>) -> Vec<PendingRequest> {
    requests.sort_by_key(|r| (r.created_at, r.id));
    requests
}

/// In-memory pending request store.
#[derive(Default)]
pub struct MemoryPendingRequestStore {
    requests: RwLock<HashMap<RpcId, PendingRequest>>,
}

impl MemoryPendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error() -> AuthKitError {
    AuthKitError::Storage("pending request store lock poisoned".into())
}

#[async_trait]
impl PendingRequestStore for MemoryPendingRequestStore {
    async fn put(&self, request: PendingRequest) -> Result<bool> {
        let mut requests = self.requests.write().map_err(|_| lock_error())?;
        if requests.contains_key(&request.id) {
            return Ok(false);
        }
        requests.insert(request.id, request);
        Ok(true)
    }

    async fn get(&self, id: RpcId) -> Result<Option<PendingRequest>> {
        Ok(self.requests.read().map_err(|_| lock_error())?.get(&id).cloned())
    }

    async fn remove(&self, id: RpcId) -> Result<Option<PendingRequest>> {
        Ok(self.requests.write().map_err(|_| lock_error())?.remove(&id))
    }

    async fn list(&self, account: &Account) -> Result<Vec<PendingRequest>> {
        let requests = self.requests.read().map_err(|_| lock_error())?;
        Ok(sorted(
            requests
                .values()
                .filter(|r| r.visible_to(account))
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<PendingRequest>> {
        let requests = self.requests.read().map_err(|_| lock_error())?;
        Ok(sorted(requests.values().cloned().collect()))
    }
}

/// Pending request store persisting one JSON file per request.
///
/// Entries found on disk are loaded when the store is opened.
pub struct FilePendingRequestStore {
    base_path: PathBuf,
    requests: Mutex<HashMap<RpcId, PendingRequest>>,
}

fn io_error(context: &str, err: std::io::Error) -> AuthKitError {
    AuthKitError::Storage(format!("{}: {}", context, err))
}

impl FilePendingRequestStore {
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| io_error("failed to create pending store directory", e))?;

        let mut requests = HashMap::new();
        for entry in std::fs::read_dir(&base_path)
            .map_err(|e| io_error("failed to read pending store directory", e))?
        {
            let path = entry
                .map_err(|e| io_error("failed to read pending store entry", e))?
                .path();
            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let json = std::fs::read_to_string(&path)
                .map_err(|e| io_error("failed to read pending request", e))?;
            match serde_json::from_str::<PendingRequest>(&json) {
                Ok(request) => {
                    requests.insert(request.id, request);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable pending request");
                }
            }
        }
        tracing::debug!(count = requests.len(), path = %base_path.display(), "pending store opened");

        Ok(Self {
            base_path,
            requests: Mutex::new(requests),
        })
    }

    fn request_path(&self, id: RpcId) -> PathBuf {
        self.base_path.join(format!("{}.json", id))
    }
}

#[async_trait]
impl PendingRequestStore for FilePendingRequestStore {
    async fn put(&self, request: PendingRequest) -> Result<bool> {
        let mut requests = self.requests.lock().map_err(|_| lock_error())?;
        if requests.contains_key(&request.id) {
            return Ok(false);
        }
        let json = serde_json::to_string_pretty(&request)?;
        std::fs::write(self.request_path(request.id), json)
            .map_err(|e| io_error("failed to write pending request", e))?;
        requests.insert(request.id, request);
        Ok(true)
    }

    async fn get(&self, id: RpcId) -> Result<Option<PendingRequest>> {
        Ok(self.requests.lock().map_err(|_| lock_error())?.get(&id).cloned())
    }

    async fn remove(&self, id: RpcId) -> Result<Option<PendingRequest>> {
        let mut requests = self.requests.lock().map_err(|_| lock_error())?;
        let removed = requests.remove(&id);
        if removed.is_some() {
            match std::fs::remove_file(self.request_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("failed to delete pending request", e)),
            }
        }
        Ok(removed)
    }

    async fn list(&self, account: &Account) -> Result<Vec<PendingRequest>> {
        let requests = self.requests.lock().map_err(|_| lock_error())?;
        Ok(sorted(
            requests
                .values()
                .filter(|r| r.visible_to(account))
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<PendingRequest>> {
        let requests = self.requests.lock().map_err(|_| lock_error())?;
        Ok(sorted(requests.values().cloned().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_topic;
    use serde_json::json;
    use tempfile::tempdir;

    fn alice() -> Account {
        Account::parse("eip155:1:0xa11ce").unwrap()
    }

    fn bob() -> Account {
        Account::parse("eip155:1:0xb0b").unwrap()
    }

    fn request(id: u64) -> PendingRequest {
        PendingRequest::new(
            RpcId(id),
            derive_topic(&id.to_be_bytes()),
            "wc_authRequest",
            Direction::Incoming,
            json!({ "n": id }),
            60,
        )
    }

    async fn exercise(store: &dyn PendingRequestStore) {
        assert!(store.put(request(1).with_account(alice())).await.unwrap());
        assert!(!store.put(request(1).with_account(bob())).await.unwrap());
        store.put(request(2).with_account(bob())).await.unwrap();
        store.put(request(3)).await.unwrap();

        let listed: Vec<_> = store.list(&alice()).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![RpcId(1), RpcId(3)]);
        assert_eq!(store.get(RpcId(1)).await.unwrap().unwrap().account, Some(alice()));

        assert!(store.remove(RpcId(1)).await.unwrap().is_some());
        assert!(store.remove(RpcId(1)).await.unwrap().is_none());
        assert!(store.get(RpcId(1)).await.unwrap().is_none());
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_semantics() {
        exercise(&MemoryPendingRequestStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_semantics() {
        let dir = tempdir().unwrap();
        exercise(&FilePendingRequestStore::open(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FilePendingRequestStore::open(dir.path()).unwrap();
            store.put(request(7).with_account(alice())).await.unwrap();
            store.put(request(8)).await.unwrap();
            store.remove(RpcId(8)).await.unwrap();
        }

        let reopened = FilePendingRequestStore::open(dir.path()).unwrap();
        let listed = reopened.list(&alice()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, RpcId(7));
        assert_eq!(listed[0].params, json!({ "n": 7 }));
    }

    #[test]
    fn test_expiry() {
        let r = request(1);
        assert!(!r.is_expired(r.created_at));
        assert!(r.is_expired(r.created_at + 60));
    }
}
