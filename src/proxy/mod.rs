//! Proxy pool: records with health state, a round-robin dispenser and the
//! distributor that owns the proxy currently wired into the live browser.

mod dispenser;
mod distributor;
mod record;

pub use dispenser::{acquire_backoff, NoProxyAvailable, ProxyDispenser};
pub use distributor::ProxyDistributor;
pub use record::{ProxyParseError, ProxyRecord, RATE_LIMIT_COOLDOWN};
