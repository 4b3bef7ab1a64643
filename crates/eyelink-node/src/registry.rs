//! Eye registry -- the server's set of live eyes, keyed by name.
//!
//! All mutation goes through one async mutex: registrations from the
//! discovery loop and removals from departure watchers may race.
//! Reads for broadcast and lookup snapshot the map and release the lock
//! before doing any I/O, so a removed eye may still see one extra send.

use std::collections::HashMap;
use std::sync::Arc;

use eyelink_protocol::Message;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::eye::Eye;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("eye {0} is already registered")]
    Duplicate(String),
}

/// Thread-safe registry of live eyes.
#[derive(Clone, Default)]
pub struct EyeRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Eye>>>>,
}

impl EyeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an eye under its name. The first registration of a name wins.
    pub async fn register(&self, eye: Arc<Eye>) -> Result<(), RegistryError> {
        let registry_size = {
            let mut eyes = self.inner.lock().await;
            if eyes.contains_key(eye.name()) {
                tracing::warn!(eye = %eye.name(), "registry: duplicate registration rejected");
                return Err(RegistryError::Duplicate(eye.name().to_string()));
            }
            eyes.insert(eye.name().to_string(), eye.clone());
            eyes.len()
        };
        tracing::info!(
            eye = %eye.name(),
            ip = %eye.ip(),
            control_port = eye.control_port(),
            registry_size,
            "registry: eye added"
        );
        Ok(())
    }

    /// Remove and close an eye. Unknown names are logged and ignored.
    pub async fn deregister(&self, name: &str) -> Option<Arc<Eye>> {
        let (removed, registry_size) = {
            let mut eyes = self.inner.lock().await;
            (eyes.remove(name), eyes.len())
        };
        match removed {
            Some(eye) => {
                eye.close().await;
                tracing::info!(eye = %name, registry_size, "registry: eye removed");
                Some(eye)
            }
            None => {
                tracing::debug!(eye = %name, "registry: deregister for unknown eye");
                None
            }
        }
    }

    /// Remove `eye` only if it is still the instance registered under its
    /// name. A newer registration of the same name is left alone.
    pub async fn deregister_instance(&self, eye: &Arc<Eye>) -> bool {
        let (removed, registry_size) = {
            let mut eyes = self.inner.lock().await;
            match eyes.get(eye.name()) {
                Some(current) if Arc::ptr_eq(current, eye) => {
                    eyes.remove(eye.name());
                    (true, eyes.len())
                }
                _ => (false, eyes.len()),
            }
        };
        eye.close().await;
        if removed {
            tracing::info!(eye = %eye.name(), registry_size, "registry: eye removed");
        }
        removed
    }

    /// Deregister `eye` once it departs.
    pub fn watch(&self, eye: Arc<Eye>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let reason = eye.departed().await;
            tracing::debug!(eye = %eye.name(), ?reason, "registry: eye departed");
            registry.deregister_instance(&eye).await;
        })
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<Eye>> {
        self.inner.lock().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.lock().await.contains_key(name)
    }

    /// Snapshot of every live eye.
    pub async fn eyes(&self) -> Vec<Arc<Eye>> {
        self.inner.lock().await.values().cloned().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Send `message` to every live eye. Returns how many sends succeeded;
    /// one eye's failure does not affect the others.
    pub async fn broadcast(&self, message: Message) -> usize {
        let eyes = self.eyes().await;
        let message = &message;
        let sends = eyes.iter().map(|eye| {
            let receipt = eye.send(message.clone());
            async move {
                match receipt.wait().await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            eye = %eye.name(),
                            code = message.code().name(),
                            "registry: broadcast send failed: {e}"
                        );
                        false
                    }
                }
            }
        });
        let delivered = futures_util::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        tracing::debug!(
            code = message.code().name(),
            delivered,
            total = eyes.len(),
            "registry: broadcast"
        );
        delivered
    }

    /// Remove and close every eye.
    pub async fn clear(&self) {
        let drained: Vec<Arc<Eye>> = self.inner.lock().await.drain().map(|(_, e)| e).collect();
        for eye in &drained {
            eye.close().await;
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "registry: all eyes removed");
        }
    }
}
