use serde::{Deserialize, Serialize};

/// Pool watermark parameters carried by the NNC spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalerConfig {
    pub batch_size: i64,
    pub min_free_percent: i64,
    pub max_free_percent: i64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            min_free_percent: 50,
            max_free_percent: 150,
        }
    }
}

impl ScalerConfig {
    pub fn min_free(&self) -> i64 {
        ceil_div(self.batch_size * self.min_free_percent, 100)
    }

    pub fn max_free(&self) -> i64 {
        ceil_div(self.batch_size * self.max_free_percent, 100)
    }
}

/// Record counts per lifecycle state, snapshotted from the IP-config store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub available: i64,
    pub allocated: i64,
    pub pending_programming: i64,
    pub pending_release: i64,
}

impl PoolCounts {
    pub fn total(&self) -> i64 {
        self.available + self.allocated + self.pending_programming
    }

    pub fn free(&self) -> i64 {
        self.available + self.pending_programming
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolDecision {
    NoOp,
    Expand {
        requested_ip_count: i64,
    },
    Contract {
        requested_ip_count: i64,
        release_count: i64,
    },
}

/// One sizing step of the pool monitor.
///
/// Expansion rounds the requested count up to the next batch above the
/// current allocation. Contraction requires a full batch of `Available`
/// records to exist, since IPs pending release cannot be taken from pods.
pub fn decide(counts: &PoolCounts, config: &ScalerConfig, requested_ip_count: i64) -> PoolDecision {
    let min_free = config.min_free();
    let max_free = config.max_free();
    let free = counts.free();

    if free < min_free {
        let requested = (ceil_div(counts.allocated, config.batch_size) + 1) * config.batch_size;
        return PoolDecision::Expand {
            requested_ip_count: requested,
        };
    }

    if free > max_free && counts.available >= config.batch_size {
        return PoolDecision::Contract {
            requested_ip_count: requested_ip_count - config.batch_size,
            release_count: config.batch_size,
        };
    }

    PoolDecision::NoOp
}

fn ceil_div(n: i64, d: i64) -> i64 {
    (n + d - 1) / d
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(batch_size: i64, min_free_percent: i64, max_free_percent: i64) -> ScalerConfig {
        ScalerConfig {
            batch_size,
            min_free_percent,
            max_free_percent,
        }
    }

    #[rstest(
        cfg,
        min_free,
        max_free,
        case(config(16, 50, 100), 8, 16),
        case(config(16, 50, 150), 8, 24),
        case(config(10, 25, 100), 3, 10),
        case(config(1, 100, 100), 1, 1),
    )]
    fn works_watermarks(cfg: ScalerConfig, min_free: i64, max_free: i64) {
        assert_eq!(cfg.min_free(), min_free);
        assert_eq!(cfg.max_free(), max_free);
    }

    #[test]
    fn works_expand_below_min_free() {
        let counts = PoolCounts {
            available: 2,
            allocated: 14,
            pending_programming: 0,
            pending_release: 0,
        };
        let decision = decide(&counts, &config(16, 50, 100), 16);
        assert_eq!(
            decision,
            PoolDecision::Expand {
                requested_ip_count: 32
            }
        );
    }

    #[test]
    fn works_contract_above_max_free() {
        let counts = PoolCounts {
            available: 20,
            allocated: 4,
            pending_programming: 0,
            pending_release: 0,
        };
        let decision = decide(&counts, &config(16, 50, 100), 32);
        assert_eq!(
            decision,
            PoolDecision::Contract {
                requested_ip_count: 16,
                release_count: 16
            }
        );
    }

    #[rstest(
        available,
        allocated,
        case(8, 8),   // exactly at min free
        case(16, 0),  // exactly at max free
        case(10, 10), // between the watermarks
    )]
    fn works_noop_between_watermarks(available: i64, allocated: i64) {
        let counts = PoolCounts {
            available,
            allocated,
            pending_programming: 0,
            pending_release: 0,
        };
        assert_eq!(decide(&counts, &config(16, 50, 100), 16), PoolDecision::NoOp);
    }

    #[test]
    fn works_no_contract_without_a_full_available_batch() {
        // Free is above the high watermark, but part of it is still pending
        // programming and cannot be marked for release.
        let counts = PoolCounts {
            available: 12,
            allocated: 0,
            pending_programming: 6,
            pending_release: 0,
        };
        assert_eq!(decide(&counts, &config(16, 50, 100), 32), PoolDecision::NoOp);
    }

    #[test]
    fn works_pending_programming_counts_as_free() {
        let counts = PoolCounts {
            available: 0,
            allocated: 0,
            pending_programming: 8,
            pending_release: 0,
        };
        assert_eq!(decide(&counts, &config(16, 50, 100), 16), PoolDecision::NoOp);
    }

    #[test]
    fn works_expand_from_empty_pool() {
        let counts = PoolCounts::default();
        let decision = decide(&counts, &config(16, 50, 100), 0);
        assert_eq!(
            decision,
            PoolDecision::Expand {
                requested_ip_count: 16
            }
        );
    }
}
