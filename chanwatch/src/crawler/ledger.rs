//! Per-hostname bot-block ledger.
//!
//! Blocks are stored inside the channel's settings blob and keyed by
//! (hostname, context). A block lifts once the hostname's cooldown has
//! elapsed. Hostnames with no cooldown entry stay blocked until cleared by
//! hand.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use super::normalize::base_domain;
use crate::database::{ChannelGuard, Database, Result};
use chanwatch_types::{BlockContext, ChannelSettings};

/// Built-in cooldowns in minutes.
const DEFAULT_COOLDOWNS: &[(&str, u64)] = &[
    ("youtube.com", 720),
    ("x.com", 720),
    ("twitter.com", 720),
    ("rumble.com", 360),
    ("bitchute.com", 360),
    ("odysee.com", 180),
    ("vimeo.com", 180),
    ("tiktok.com", 1440),
    ("instagram.com", 1440),
];

/// Hostname to cooldown table.
#[derive(Debug, Clone)]
pub struct CooldownTable {
    minutes: HashMap<String, u64>,
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_COOLDOWNS
                .iter()
                .map(|(host, mins)| (host.to_string(), *mins))
                .collect(),
        }
    }
}

impl CooldownTable {
    /// A table with no entries; every block needs a manual clear.
    pub fn empty() -> Self {
        Self {
            minutes: HashMap::new(),
        }
    }

    /// Defaults with `overrides` layered on top.
    pub fn with_overrides(overrides: &HashMap<String, u64>) -> Self {
        let mut table = Self::default();
        for (host, mins) in overrides {
            table.insert(host, *mins);
        }
        table
    }

    pub fn insert(&mut self, hostname: &str, minutes: u64) {
        self.minutes.insert(hostname.to_ascii_lowercase(), minutes);
    }

    /// Cooldown for a hostname. Tries the exact host, then without `www.`,
    /// then the registrable domain.
    pub fn cooldown_for(&self, hostname: &str) -> Option<Duration> {
        let host = hostname.to_ascii_lowercase();
        let candidates = [
            Some(host.clone()),
            host.strip_prefix("www.").map(str::to_string),
            Some(base_domain(&host)),
        ];

        candidates
            .into_iter()
            .flatten()
            .find_map(|h| self.minutes.get(&h).copied())
            .map(|mins| Duration::from_secs(mins * 60))
    }
}

/// A block that is still in force after a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWait {
    pub hostname: String,
    pub context: BlockContext,
    /// `None` when the hostname has no cooldown and needs a manual clear.
    pub remaining: Option<Duration>,
}

/// Result of [`BlockLedger::check_or_unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerStatus {
    /// No blocks remain; the channel may be crawled.
    Clear,
    /// At least one hostname is still blocked.
    Blocked { remaining: Vec<BlockWait> },
}

/// Bot-block state machine over the settings blob.
#[derive(Debug, Clone, Default)]
pub struct BlockLedger {
    cooldowns: CooldownTable,
}

impl BlockLedger {
    pub fn new(cooldowns: CooldownTable) -> Self {
        Self { cooldowns }
    }

    /// Mark `hostname` blocked in `context` as of `at`.
    pub fn record_block(
        &self,
        db: &Database,
        guard: &ChannelGuard,
        hostname: &str,
        context: BlockContext,
        at: DateTime<Utc>,
    ) -> Result<()> {
        db.update_channel_settings(guard, |s| {
            s.record_block(hostname, context, at);
            Ok::<_, Infallible>(())
        })?;
        warn!(
            "BlockLedger: channel {} blocked on {} ({})",
            guard.channel_id(),
            hostname,
            context
        );
        Ok(())
    }

    /// Lift every block whose cooldown has elapsed.
    pub fn check_or_unlock(&self, db: &Database, guard: &ChannelGuard) -> Result<LedgerStatus> {
        self.check_or_unlock_at(db, guard, Utc::now())
    }

    pub fn check_or_unlock_at(
        &self,
        db: &Database,
        guard: &ChannelGuard,
        now: DateTime<Utc>,
    ) -> Result<LedgerStatus> {
        let current = db.require_channel(guard.channel_id())?.settings;
        if !current.is_blocked() && !current.bot_blocked {
            return Ok(LedgerStatus::Clear);
        }

        let mut status = LedgerStatus::Clear;
        db.update_channel_settings(guard, |s| {
            status = self.unlock_expired(s, now);
            Ok::<_, Infallible>(())
        })?;

        match &status {
            LedgerStatus::Clear => {
                info!("BlockLedger: channel {} unblocked", guard.channel_id());
            }
            LedgerStatus::Blocked { remaining } => {
                for wait in remaining {
                    match wait.remaining {
                        Some(d) => debug!(
                            "BlockLedger: {} ({}) blocked for another {}s",
                            wait.hostname,
                            wait.context,
                            d.as_secs()
                        ),
                        None => debug!(
                            "BlockLedger: {} ({}) has no cooldown, clear it manually",
                            wait.hostname, wait.context
                        ),
                    }
                }
            }
        }

        Ok(status)
    }

    /// Manually drop every block on the channel.
    pub fn clear(&self, db: &Database, guard: &ChannelGuard) -> Result<usize> {
        let mut cleared = 0;
        db.update_channel_settings(guard, |s| {
            cleared = s.clear_blocks();
            Ok::<_, Infallible>(())
        })?;
        info!(
            "BlockLedger: cleared {} block(s) on channel {}",
            cleared,
            guard.channel_id()
        );
        Ok(cleared)
    }

    /// Drop the blocks on one hostname, in every context.
    pub fn clear_host(&self, db: &Database, guard: &ChannelGuard, hostname: &str) -> Result<usize> {
        let hostname = hostname.to_ascii_lowercase();
        let mut cleared = 0;
        db.update_channel_settings(guard, |s| {
            let contexts: Vec<BlockContext> = s
                .blocked
                .iter()
                .filter(|e| e.hostname == hostname)
                .map(|e| e.context)
                .collect();
            cleared = contexts
                .into_iter()
                .filter(|context| s.remove_block(&hostname, *context))
                .count();
            Ok::<_, Infallible>(())
        })?;
        info!(
            "BlockLedger: cleared {} block(s) for {} on channel {}",
            cleared,
            hostname,
            guard.channel_id()
        );
        Ok(cleared)
    }

    /// Remove expired entries from `settings` and report what is left.
    fn unlock_expired(&self, settings: &mut ChannelSettings, now: DateTime<Utc>) -> LedgerStatus {
        let mut remaining = Vec::new();

        settings.blocked.retain(|entry| {
            let Some(cooldown) = self.cooldowns.cooldown_for(&entry.hostname) else {
                remaining.push(BlockWait {
                    hostname: entry.hostname.clone(),
                    context: entry.context,
                    remaining: None,
                });
                return true;
            };

            // Negative elapsed (clock moved back) counts as not yet elapsed
            let elapsed = (now - entry.blocked_at).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= cooldown {
                false
            } else {
                remaining.push(BlockWait {
                    hostname: entry.hostname.clone(),
                    context: entry.context,
                    remaining: Some(cooldown - elapsed),
                });
                true
            }
        });

        settings.bot_blocked = !settings.blocked.is_empty();
        if remaining.is_empty() {
            LedgerStatus::Clear
        } else {
            LedgerStatus::Blocked { remaining }
        }
    }
}
