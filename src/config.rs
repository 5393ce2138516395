//! Per-call tuning for replicated operations and the routing step that
//! precedes them.
//!
//! | Type | Controls |
//! |------|----------|
//! | [`RequestConfig`] | quorum size, over-provisioning, tolerated failed rounds |
//! | [`RoutingConfig`] | how the candidate set is discovered |

use serde::{Deserialize, Serialize};

use crate::result::DhtError;

/// Replicas that must confirm before a call counts as complete.
pub const DEFAULT_MINIMUM_RESULTS: usize = 3;

/// Extra in-flight requests beyond the quorum, used to mask slow peers.
pub const DEFAULT_PARALLEL_DIFF: usize = 0;

/// Failed rounds tolerated before the coordinator settles for what it has.
pub const DEFAULT_MAX_FAILURE: usize = 5;

pub const DEFAULT_ROUTING_DIRECT_HITS: usize = 5;
pub const DEFAULT_ROUTING_MAX_NO_NEW_INFO_DIFF: usize = 10;
pub const DEFAULT_ROUTING_MAX_FAILURES: usize = 3;
pub const DEFAULT_ROUTING_MAX_SUCCESS: usize = 20;
pub const DEFAULT_ROUTING_PARALLEL: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub minimum_results: usize,
    pub parallel_diff: usize,
    pub max_failure: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            minimum_results: DEFAULT_MINIMUM_RESULTS,
            parallel_diff: DEFAULT_PARALLEL_DIFF,
            max_failure: DEFAULT_MAX_FAILURE,
        }
    }
}

impl RequestConfig {
    pub fn with_minimum_results(mut self, minimum_results: usize) -> Self {
        self.minimum_results = minimum_results;
        self
    }

    pub fn with_parallel_diff(mut self, parallel_diff: usize) -> Self {
        self.parallel_diff = parallel_diff;
        self
    }

    pub fn with_max_failure(mut self, max_failure: usize) -> Self {
        self.max_failure = max_failure;
        self
    }

    /// Maximum concurrent requests per round.
    #[inline]
    pub fn parallel(&self) -> usize {
        self.minimum_results.saturating_add(self.parallel_diff)
    }

    /// Reject configurations that cannot make progress.
    ///
    /// Counts are unsigned, so `parallel >= minimum_results` always holds
    /// once the sum fits; what is left is an overflowing `parallel` and a
    /// zero-width round.
    pub fn validate(&self) -> Result<(), DhtError> {
        if self.minimum_results.checked_add(self.parallel_diff).is_none() {
            return Err(DhtError::InvalidConfiguration(
                "minimum_results + parallel_diff overflows".into(),
            ));
        }
        if self.parallel() == 0 {
            return Err(DhtError::InvalidConfiguration(
                "parallel must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Direct hits to accept before routing stops early.
    pub direct_hits: usize,
    /// Rounds without closer peers tolerated, on top of `minimum_results`.
    pub max_no_new_info_diff: usize,
    pub max_failures: usize,
    pub max_success: usize,
    /// Routing fan-out width.
    pub parallel: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            direct_hits: DEFAULT_ROUTING_DIRECT_HITS,
            max_no_new_info_diff: DEFAULT_ROUTING_MAX_NO_NEW_INFO_DIFF,
            max_failures: DEFAULT_ROUTING_MAX_FAILURES,
            max_success: DEFAULT_ROUTING_MAX_SUCCESS,
            parallel: DEFAULT_ROUTING_PARALLEL,
        }
    }
}

impl RoutingConfig {
    pub fn with_direct_hits(mut self, direct_hits: usize) -> Self {
        self.direct_hits = direct_hits;
        self
    }

    pub fn with_max_no_new_info_diff(mut self, diff: usize) -> Self {
        self.max_no_new_info_diff = diff;
        self
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_max_success(mut self, max_success: usize) -> Self {
        self.max_success = max_success;
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// "No new information" tolerance for a call that wants
    /// `minimum_results` replicas.
    #[inline]
    pub fn max_no_new_info(&self, minimum_results: usize) -> usize {
        self.max_no_new_info_diff.saturating_add(minimum_results)
    }

    pub fn validate(&self) -> Result<(), DhtError> {
        if self.parallel == 0 {
            return Err(DhtError::InvalidConfiguration(
                "routing parallel must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_is_minimum_plus_diff() {
        let cfg = RequestConfig::default()
            .with_minimum_results(2)
            .with_max_failure(1)
            .with_parallel_diff(1);
        assert_eq!(cfg.parallel(), 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn defaults_validate() {
        assert!(RequestConfig::default().validate().is_ok());
        assert!(RoutingConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_width_round_is_rejected() {
        let cfg = RequestConfig::default()
            .with_minimum_results(0)
            .with_max_failure(0)
            .with_parallel_diff(0);
        assert!(matches!(
            cfg.validate(),
            Err(DhtError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn zero_diff_is_the_narrowest_valid_round() {
        let cfg = RequestConfig::default()
            .with_minimum_results(1)
            .with_parallel_diff(0);
        assert_eq!(cfg.parallel(), cfg.minimum_results);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn overflowing_parallel_is_rejected() {
        let cfg = RequestConfig::default()
            .with_minimum_results(usize::MAX)
            .with_max_failure(0)
            .with_parallel_diff(1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn routing_zero_parallel_is_rejected() {
        let cfg = RoutingConfig::default().with_parallel(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_no_new_info_tracks_minimum_results() {
        let cfg = RoutingConfig::default().with_max_no_new_info_diff(4);
        assert_eq!(cfg.max_no_new_info(3), 7);
    }
}
