//! Per-client request budgets.
//!
//! # States (per client IP)
//! ```text
//! Absent    → Active:    first request creates {remaining = max, reset = now + window}
//! Active    → Active:    each settled request decrements remaining by exactly one
//! Active    → Exhausted: remaining reaches 0, further requests are refused
//! any       → Absent:    purge sweep after reset time, or replaced on next lookup
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::config::RateLimitConfig;

/// Budget tracked for one client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub remaining: u32,
    pub reset_time: SystemTime,
}

/// Snapshot of a client's budget, reported in response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: SystemTime,
}

impl RateLimitStatus {
    /// Reset time as Unix seconds.
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Whole seconds until the window resets, rounded up.
    pub fn retry_after_secs(&self, now: SystemTime) -> u64 {
        let wait = self.reset_time.duration_since(now).unwrap_or_default();
        let secs = wait.as_secs();
        if wait.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Outcome of checking a request against its client's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Limiting disabled, or a loopback client.
    Exempt,
    Allowed(RateLimitStatus),
    Limited(RateLimitStatus),
}

/// Thread-safe store of per-IP budgets.
#[derive(Debug)]
pub struct RateLimiter {
    records: DashMap<IpAddr, RateLimitRecord>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn window(&self) -> Duration {
        self.config.window()
    }

    /// Whether requests from `ip` bypass accounting entirely.
    pub fn is_exempt(&self, ip: IpAddr) -> bool {
        !self.config.enabled || (self.config.exempt_loopback && ip.to_canonical().is_loopback())
    }

    pub fn check(&self, ip: IpAddr) -> Admission {
        self.check_at(ip, SystemTime::now())
    }

    /// Look up (creating or renewing) the record for `ip` as of `now`.
    pub fn check_at(&self, ip: IpAddr, now: SystemTime) -> Admission {
        if self.is_exempt(ip) {
            return Admission::Exempt;
        }

        let mut record = self.records.entry(ip).or_insert_with(|| self.fresh_record(now));
        if record.reset_time <= now {
            *record = self.fresh_record(now);
        }

        let status = RateLimitStatus {
            limit: self.config.max_requests,
            remaining: record.remaining,
            reset_time: record.reset_time,
        };

        if record.remaining == 0 {
            Admission::Limited(status)
        } else {
            Admission::Allowed(status)
        }
    }

    /// Spend one unit of `ip`'s budget.
    pub fn record_completion(&self, ip: IpAddr) {
        if let Some(mut record) = self.records.get_mut(&ip) {
            record.remaining = record.remaining.saturating_sub(1);
        }
    }

    /// Latch that spends one unit of `ip`'s budget exactly once.
    pub fn permit(self: &Arc<Self>, ip: IpAddr) -> RequestPermit {
        RequestPermit {
            limiter: Arc::clone(self),
            ip,
            settled: false,
        }
    }

    /// Drop every record whose window has ended. Returns the number removed.
    pub fn purge_expired(&self, now: SystemTime) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.reset_time > now);
        before.saturating_sub(self.records.len())
    }

    pub fn record(&self, ip: IpAddr) -> Option<RateLimitRecord> {
        self.records.get(&ip).map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn fresh_record(&self, now: SystemTime) -> RateLimitRecord {
        RateLimitRecord {
            remaining: self.config.max_requests,
            reset_time: now.checked_add(self.window()).unwrap_or(now),
        }
    }
}

/// Spends one unit of budget when settled or dropped, whichever happens first.
///
/// Dropping without settling covers aborted requests: the connection closed
/// or the handler unwound before completing.
#[derive(Debug)]
pub struct RequestPermit {
    limiter: Arc<RateLimiter>,
    ip: IpAddr,
    settled: bool,
}

impl RequestPermit {
    pub fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            self.limiter.record_completion(self.ip);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.settle();
    }
}
