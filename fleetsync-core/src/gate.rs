//! Optional serialization of remote calls.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Held while one gated call runs. Dropping it releases the lock.
pub type CallPermit = Box<dyn Send>;

/// A lock the host shares with the gate.
///
/// Implement this to gate calls on whatever the remote client already
/// synchronizes with. `Arc<tokio::sync::Mutex<()>>` implements it.
#[async_trait]
pub trait CallLock: Send + Sync {
    async fn acquire(&self) -> CallPermit;
}

#[async_trait]
impl CallLock for Arc<Mutex<()>> {
    async fn acquire(&self) -> CallPermit {
        Box::new(self.clone().lock_owned().await)
    }
}

/// Mutual exclusion around single remote calls.
///
/// Some remote clients are not safe for concurrent use. Callers wrap each
/// individual call (never a whole retry loop) in [`CallGate::call`]; an open
/// gate adds nothing, a serialized gate holds a shared lock for the duration
/// of that one call.
#[derive(Clone, Default)]
pub struct CallGate {
    lock: Option<Arc<dyn CallLock>>,
}

impl fmt::Debug for CallGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGate")
            .field("serialized", &self.is_serialized())
            .finish()
    }
}

impl CallGate {
    /// Gate that lets calls run concurrently.
    pub fn open() -> Self {
        Self { lock: None }
    }

    /// Gate with its own lock.
    pub fn serialized() -> Self {
        Self::shared(Arc::new(Mutex::new(())))
    }

    /// Gate acquiring an externally owned lock.
    pub fn shared(lock: impl CallLock + 'static) -> Self {
        Self {
            lock: Some(Arc::new(lock)),
        }
    }

    pub fn is_serialized(&self) -> bool {
        self.lock.is_some()
    }

    /// Run `fut` while holding the gate.
    pub async fn call<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        match &self.lock {
            Some(lock) => {
                let _permit = lock.acquire().await;
                fut.await
            }
            None => fut.await,
        }
    }
}
