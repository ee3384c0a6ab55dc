use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Opaque conversation token issued by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Returns `None` for blank keys; backends send `""` before a session exists.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one chat instance among the instances sharing a host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(format!("gcw-{}", &simple[..12]))
    }

    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespaces an element or callback name under this instance.
    pub fn scoped(&self, suffix: &str) -> String {
        format!("{}-{}", self.0, suffix)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session key slot shared between an instance and its connection task, so a
/// reconnect handshake always carries the latest key.
#[derive(Clone, Debug, Default)]
pub struct SharedSessionKey {
    inner: Arc<RwLock<Option<SessionKey>>>,
}

impl SharedSessionKey {
    pub fn new(initial: Option<SessionKey>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self) -> Option<SessionKey> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Adopts the key returned by the backend. Returns `true` when it changed.
    pub fn adopt(&self, key: SessionKey) -> bool {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(existing) if *existing == key => false,
            Some(existing) => {
                info!(previous = %existing, current = %key, "backend replaced session key");
                *guard = Some(key);
                true
            }
            None => {
                debug!(session_key = %key, "session established");
                *guard = Some(key);
                true
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiState {
    Open,
    Closed,
}

#[derive(Clone, Debug)]
pub struct SessionContext {
    pub instance_id: InstanceId,
    session_key: SharedSessionKey,
    ui: UiState,
}

impl SessionContext {
    pub fn new(instance_id: InstanceId, ui: UiState) -> Self {
        Self {
            instance_id,
            session_key: SharedSessionKey::default(),
            ui,
        }
    }

    pub fn with_session_key(mut self, key: SessionKey) -> Self {
        self.session_key = SharedSessionKey::new(Some(key));
        self
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.session_key.get()
    }

    pub fn shared_key(&self) -> SharedSessionKey {
        self.session_key.clone()
    }

    pub fn ui(&self) -> UiState {
        self.ui
    }

    pub fn set_ui(&mut self, ui: UiState) -> bool {
        let changed = self.ui != ui;
        self.ui = ui;
        changed
    }
}
