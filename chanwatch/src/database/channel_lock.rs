//! Per-channel mutual exclusion.
//!
//! Settings blobs are updated with plain read-modify-write, so two tasks
//! mutating the same channel would silently lose one update. Every mutation
//! entry point therefore takes a [`ChannelGuard`], which can only be obtained
//! from [`ChannelLocks`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of per-channel locks.
#[derive(Default)]
pub struct ChannelLocks {
    locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, channel_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(channel_id).or_default())
    }

    /// Wait for exclusive access to a channel.
    pub async fn lock(&self, channel_id: i64) -> ChannelGuard {
        let permit = self.entry(channel_id).lock_owned().await;
        ChannelGuard {
            channel_id,
            _permit: permit,
        }
    }

    /// Take exclusive access without waiting. Returns None if held elsewhere.
    pub fn try_lock(&self, channel_id: i64) -> Option<ChannelGuard> {
        let permit = self.entry(channel_id).try_lock_owned().ok()?;
        Some(ChannelGuard {
            channel_id,
            _permit: permit,
        })
    }
}

/// Proof of exclusive access to one channel's settings.
pub struct ChannelGuard {
    channel_id: i64,
    _permit: OwnedMutexGuard<()>,
}

impl ChannelGuard {
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }
}

impl std::fmt::Debug for ChannelGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGuard")
            .field("channel_id", &self.channel_id)
            .finish()
    }
}
