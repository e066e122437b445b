//! Round-robin source of eligible proxy candidates.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use super::ProxyRecord;

/// Delay before retrying after pool exhaustion: exponential with jitter,
/// capped at one minute.
pub fn acquire_backoff(attempt: u32) -> std::time::Duration {
    use rand::Rng;

    const BASE_MS: u64 = 500;
    const MAX_MS: u64 = 60_000;

    let base_delay = BASE_MS * 2u64.pow(attempt.saturating_sub(1).min(5));
    let capped_delay = base_delay.min(MAX_MS);

    // +/-20% jitter
    let jitter_range = capped_delay / 5;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range * 2) as i64 - jitter_range as i64
    } else {
        0
    };

    std::time::Duration::from_millis((capped_delay as i64 + jitter).max(0) as u64)
}

/// The eligible set is empty. Callers back off and retry; this is not fatal.
#[derive(Debug, Error)]
#[error("no eligible proxy available")]
pub struct NoProxyAvailable;

/// Dispenses non-excluded proxies in round-robin order.
pub struct ProxyDispenser {
    records: Vec<Arc<ProxyRecord>>,
    cursor: AtomicUsize,
}

impl ProxyDispenser {
    pub fn new(records: Vec<ProxyRecord>) -> Self {
        Self {
            records: records.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Load a proxy list, one proxy per line. Blank lines and `#` comments
    /// are skipped; unparsable lines are logged and skipped.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut records = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match ProxyRecord::parse(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping proxy list entry: {}", e),
            }
        }

        info!(
            "Loaded {} proxies from {:?}",
            records.len(),
            path.as_ref()
        );
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Yield the next eligible proxy, skipping invalidated records and
    /// records whose cooldown has not elapsed.
    pub fn get_candidate_proxy(&self) -> Result<Arc<ProxyRecord>, NoProxyAvailable> {
        let count = self.records.len();
        if count == 0 {
            return Err(NoProxyAvailable);
        }

        let now = Instant::now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..count {
            let record = &self.records[(start + offset) % count];
            if record.is_eligible_at(now) {
                return Ok(record.clone());
            }
        }

        Err(NoProxyAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(records: Vec<ProxyRecord>) -> ProxyDispenser {
        ProxyDispenser::new(records)
    }

    #[test]
    fn test_round_robin_over_eligible() {
        let dispenser = pool(vec![
            ProxyRecord::new("http", "10.0.0.1", 8080),
            ProxyRecord::new("http", "10.0.0.2", 8080),
        ]);

        let first = dispenser.get_candidate_proxy().unwrap();
        let second = dispenser.get_candidate_proxy().unwrap();
        assert_ne!(first.url(), second.url());
    }

    #[test]
    fn test_never_yields_excluded_records() {
        let invalidated = ProxyRecord::new("http", "10.0.0.1", 8080);
        invalidated.invalidate();
        let cooling = ProxyRecord::new("http", "10.0.0.2", 8080);
        cooling.rate_limited_for(Duration::from_secs(60));
        let healthy = ProxyRecord::new("http", "10.0.0.3", 8080);

        let dispenser = pool(vec![invalidated, cooling, healthy]);

        for _ in 0..10 {
            let candidate = dispenser.get_candidate_proxy().unwrap();
            assert_eq!(candidate.host, "10.0.0.3");
        }
    }

    #[test]
    fn test_empty_pool_is_no_proxy() {
        let dispenser = pool(vec![]);
        assert!(dispenser.get_candidate_proxy().is_err());
    }

    #[test]
    fn test_exhaustion_after_failure() {
        // A healthy, B on cooldown: A must be selected. After A fails with a
        // proxy-level error both are excluded and the pool reports empty.
        let a = ProxyRecord::new("http", "10.0.0.1", 8080);
        let b = ProxyRecord::new("http", "10.0.0.2", 8080);
        b.rate_limited_for(Duration::from_secs(60));

        let dispenser = pool(vec![a, b]);

        let candidate = dispenser.get_candidate_proxy().unwrap();
        assert_eq!(candidate.host, "10.0.0.1");

        candidate.rate_limited();
        assert!(dispenser.get_candidate_proxy().is_err());
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let early = acquire_backoff(1);
        let late = acquire_backoff(4);
        assert!(late.as_millis() > early.as_millis() / 2);
        assert!(acquire_backoff(30) <= Duration::from_millis(72_000));
    }

    #[test]
    fn test_cooldown_expiry_restores_eligibility() {
        let a = ProxyRecord::new("http", "10.0.0.1", 8080);
        a.rate_limited_for(Duration::from_millis(0));
        let dispenser = pool(vec![a]);

        // zero-length cooldown has already elapsed
        assert!(dispenser.get_candidate_proxy().is_ok());
    }
}
