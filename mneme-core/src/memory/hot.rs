//! Hot tier: in-process recent-turn windows
//!
//! A bounded ring of the latest turns per agent. Windows idle longer than the
//! TTL are dropped by a periodic sweep rather than on read, so reads only take
//! a shared lock. Losing this tier is never data loss; the warm and cold
//! tiers hold everything older than the call in progress.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use tracing::debug;

use super::records::ConversationTurn;
use crate::config::HotTierConfig;
use crate::error::{MnemeError, Result};

#[derive(Debug)]
struct AgentWindow {
    turns: VecDeque<ConversationTurn>,
    /// Last accepted ordinal per counterpart
    last_ordinal: HashMap<String, u64>,
    last_active: Instant,
}

/// A window dropped by the expiry sweep
#[derive(Debug, Clone)]
pub struct ExpiredWindow {
    pub agent_id: String,
    /// Turns still in the ring, oldest first
    pub turns: Vec<ConversationTurn>,
}

/// Hot tier counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotTierStats {
    pub agents: usize,
    pub turns: usize,
    pub appended: u64,
    pub rejected: u64,
    pub expired_windows: u64,
}

/// Per-agent rolling turn windows
#[derive(Debug)]
pub struct HotTier {
    config: HotTierConfig,
    windows: RwLock<HashMap<String, AgentWindow>>,
    appended: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
}

impl HotTier {
    pub fn new(config: HotTierConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            appended: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Append a turn to `agent_id`'s window.
    ///
    /// Ordinals must increase by exactly one per (agent, counterpart). The
    /// first turn seen for a pair may start anywhere, since this tier does
    /// not survive restarts.
    ///
    /// # Errors
    ///
    /// Returns [`MnemeError::OutOfOrder`] on a gap or duplicate, and
    /// [`MnemeError::InvalidRecord`] when the turn belongs to another agent.
    pub fn append(&self, agent_id: &str, turn: ConversationTurn) -> Result<()> {
        turn.validate()?;
        if turn.agent_id != agent_id {
            return Err(MnemeError::InvalidRecord(format!(
                "turn for '{}' appended under '{}'",
                turn.agent_id, agent_id
            )));
        }

        let mut windows = self.windows.write();
        let window = windows
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentWindow {
                turns: VecDeque::with_capacity(self.config.max_turns),
                last_ordinal: HashMap::new(),
                last_active: Instant::now(),
            });

        if let Some(&last) = window.last_ordinal.get(&turn.counterpart_id) {
            if turn.ordinal != last + 1 {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(MnemeError::OutOfOrder {
                    agent_id: agent_id.to_string(),
                    expected: last + 1,
                    got: turn.ordinal,
                });
            }
        }

        window
            .last_ordinal
            .insert(turn.counterpart_id.clone(), turn.ordinal);
        window.last_active = Instant::now();
        if window.turns.len() == self.config.max_turns {
            window.turns.pop_front();
        }
        window.turns.push_back(turn);
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Up to `n` most recent turns for an agent, oldest first
    pub fn recent(&self, agent_id: &str, n: usize) -> Vec<ConversationTurn> {
        let windows = self.windows.read();
        let Some(window) = windows.get(agent_id) else {
            return Vec::new();
        };
        let skip = window.turns.len().saturating_sub(n);
        window.turns.iter().skip(skip).cloned().collect()
    }

    /// Up to `n` most recent turns between an agent and one counterpart
    pub fn recent_with(&self, agent_id: &str, counterpart_id: &str, n: usize) -> Vec<ConversationTurn> {
        let windows = self.windows.read();
        let Some(window) = windows.get(agent_id) else {
            return Vec::new();
        };
        let mut turns: Vec<_> = window
            .turns
            .iter()
            .rev()
            .filter(|t| t.counterpart_id == counterpart_id)
            .take(n)
            .cloned()
            .collect();
        turns.reverse();
        turns
    }

    /// Last accepted ordinal for a pair, if the pair is in the window
    pub fn last_ordinal(&self, agent_id: &str, counterpart_id: &str) -> Option<u64> {
        self.windows
            .read()
            .get(agent_id)
            .and_then(|w| w.last_ordinal.get(counterpart_id).copied())
    }

    /// Remove and return one pair's turns, keeping its ordinal position
    pub fn take_session(&self, agent_id: &str, counterpart_id: &str) -> Vec<ConversationTurn> {
        let mut windows = self.windows.write();
        let Some(window) = windows.get_mut(agent_id) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) = window
            .turns
            .drain(..)
            .partition(|t| t.counterpart_id == counterpart_id);
        window.turns = kept.into();
        taken
    }

    /// Drop every window idle longer than the TTL and return them
    pub fn evict_expired(&self) -> Vec<ExpiredWindow> {
        let ttl = self.config.idle_ttl;
        let mut windows = self.windows.write();
        let expired: Vec<String> = windows
            .iter()
            .filter(|(_, w)| w.last_active.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        let dropped: Vec<ExpiredWindow> = expired
            .into_iter()
            .filter_map(|agent_id| {
                windows.remove(&agent_id).map(|w| ExpiredWindow {
                    agent_id,
                    turns: w.turns.into(),
                })
            })
            .collect();

        if !dropped.is_empty() {
            self.expired
                .fetch_add(dropped.len() as u64, Ordering::Relaxed);
            debug!(windows = dropped.len(), "Expired idle hot-tier windows");
        }
        dropped
    }

    pub fn stats(&self) -> HotTierStats {
        let windows = self.windows.read();
        HotTierStats {
            agents: windows.len(),
            turns: windows.values().map(|w| w.turns.len()).sum(),
            appended: self.appended.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            expired_windows: self.expired.load(Ordering::Relaxed),
        }
    }
}
