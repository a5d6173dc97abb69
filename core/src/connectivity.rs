use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

/// Point-in-time answer to "is a remote call likely to succeed right now".
#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Connectivity flag set by the host (or a test).
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_connectivity_toggles() {
        let c = StaticConnectivity::new(false);
        assert!(!c.is_online().await);
        c.set_online(true);
        assert!(c.is_online().await);
    }
}
