//! Persistence adapter: opaque blob load/store under a single key.
//!
//! The actual key/value blob storage is an external collaborator —
//! [`BlobStore`] is the trait a host application implements over whatever it
//! has (a file, a browser's IndexedDB, a mobile keystore-backed file). This
//! module owns only the part that is the core's: the `AppState` shape, the
//! single `APP_STATE` key, and tolerance of absence and malformed JSON.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::GroupId;
use crate::group::Group;

pub const APP_STATE_KEY: &str = "APP_STATE";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("blob store error: {0}")]
    Store(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// The external key/value blob store. Out of scope for this crate —
/// implement this over whatever local storage a host provides.
pub trait BlobStore: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, PersistenceError>>;
    fn store<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppState {
    pub groups: HashMap<GroupId, Group>,
    #[serde(rename = "activeGroupId", default)]
    pub active_group_id: Option<GroupId>,
}

pub struct PersistenceAdapter<B: BlobStore> {
    blob: Arc<B>,
}

impl<B: BlobStore> PersistenceAdapter<B> {
    pub fn new(blob: Arc<B>) -> Self {
        PersistenceAdapter { blob }
    }

    /// Tolerates absence and malformed JSON — both become empty state.
    /// Unknown fields in an otherwise-valid blob are ignored by `serde`
    /// automatically, and each group's event log comes back through
    /// `EventLog`'s own `Deserialize` impl, so a scrambled or duplicate-laden
    /// stored log is re-sorted and deduplicated on the way in.
    pub async fn load(&self) -> AppState {
        match self.blob.load(APP_STATE_KEY).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Ok(None) | Err(_) => AppState::default(),
        }
    }

    /// Full-blob replacement; writes are coalesced implicitly by the single
    /// mailbox that calls this.
    pub async fn save(&self, state: &AppState) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec(state).map_err(|e| PersistenceError::Store(e.to_string()))?;
        self.blob.store(APP_STATE_KEY, bytes).await
    }
}
