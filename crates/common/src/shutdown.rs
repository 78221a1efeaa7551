//! Deterministic teardown of long-lived owners (session caches, bus clients).
//!
//! Owners register themselves once at startup; the binary walks the list when
//! it receives a termination signal so open transports and child processes are
//! closed before the process exits.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {async_trait::async_trait, futures::future::join_all, tracing::{debug, info, warn}};

use crate::error::{Error, Result};

/// Something that holds resources which must be released explicitly.
#[async_trait]
pub trait Dispose: Send + Sync {
    /// Human-readable owner name used in logs.
    fn owner_name(&self) -> &str;

    /// Release every resource. Must be safe to call more than once.
    async fn dispose(&self);
}

/// Registry of owners walked on process exit.
#[derive(Default, Clone)]
pub struct ShutdownHooks {
    owners: Arc<Mutex<Vec<Arc<dyn Dispose>>>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: Arc<dyn Dispose>) {
        debug!(owner = owner.owner_name(), "registered shutdown owner");
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(owner);
    }

    pub fn len(&self) -> usize {
        self.owners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every registered owner concurrently, waiting at most `deadline`.
    ///
    /// Owners are drained so a second walk is a no-op.
    pub async fn run(&self, deadline: Duration) -> Result<()> {
        let owners: Vec<Arc<dyn Dispose>> = std::mem::take(
            &mut *self
                .owners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        if owners.is_empty() {
            return Ok(());
        }

        info!(owners = owners.len(), "running shutdown hooks");
        let started = Instant::now();
        let pending = owners.len();
        let walk = join_all(owners.iter().map(|owner| async move {
            owner.dispose().await;
            debug!(owner = owner.owner_name(), "owner disposed");
        }));

        match tokio::time::timeout(deadline, walk).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    waited_ms = started.elapsed().as_millis(),
                    "shutdown deadline passed before every owner finished"
                );
                Err(Error::ShutdownTimedOut {
                    waited_ms: started.elapsed().as_millis(),
                    pending,
                })
            },
        }
    }
}
