//! Engine configuration.

use crate::error::{Error, Result};
use crate::key::KeyMode;
use crate::timer::TimerSettings;

/// Default number of hash buckets.
pub const DEFAULT_TABLE_SIZE: usize = 1 << 12;

/// Hard ceiling on branches per transaction; the cancel bitmap is a `u32`.
pub const MAX_BRANCHES: usize = 16;

/// Tunables for the transaction engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of hash buckets; must be a power of two.
    pub table_size: usize,
    /// Branch limit per transaction, at most [`MAX_BRANCHES`].
    pub max_branches: usize,
    /// Global cap on linked transactions; `None` means unbounded. New
    /// transactions beyond the cap are rejected with
    /// [`Error::CapacityExhausted`].
    pub max_transactions: Option<usize>,
    /// Key scheme for minted branch cookies.
    pub key_mode: KeyMode,
    /// Ignore the To header when matching a CANCEL to its original
    /// transaction on the legacy path (some clients mangle it).
    pub relaxed_cancel_to: bool,
    /// Include the Request-URI in legacy field comparison.
    pub match_request_uri: bool,
    /// Include the topmost Via in legacy field comparison.
    pub match_top_via: bool,
    /// Restart a branch's final-response timer on provisional replies.
    pub restart_fr_on_provisional: bool,
    /// Allow adding failover branches from a branch's alternate
    /// destination list.
    pub dns_failover: bool,
    /// Host advertised in the topmost Via of forwarded requests.
    pub via_host: String,
    /// Port advertised in the topmost Via of forwarded requests.
    pub via_port: u16,
    pub timers: TimerSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            max_branches: MAX_BRANCHES,
            max_transactions: None,
            key_mode: KeyMode::Synonym,
            relaxed_cancel_to: true,
            match_request_uri: false,
            match_top_via: false,
            restart_fr_on_provisional: true,
            dns_failover: true,
            via_host: "127.0.0.1".to_string(),
            via_port: 5060,
            timers: TimerSettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.table_size == 0 || !self.table_size.is_power_of_two() {
            return Err(Error::Config("table_size must be a nonzero power of two"));
        }
        if self.max_branches == 0 || self.max_branches > MAX_BRANCHES {
            return Err(Error::Config("max_branches out of range"));
        }
        if self.timers.tick.is_zero() {
            return Err(Error::Config("timer tick must be nonzero"));
        }
        Ok(())
    }
}
