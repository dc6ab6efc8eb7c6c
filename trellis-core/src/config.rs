//! Build-time and query-time HNSW configuration.

use crate::distance::DistanceMetric;
use anyhow::Result;

/// Ratio between the shrink trigger and the max degree of a layer.
pub const DEFAULT_DEGREE_THRESHOLD_RATIO: f64 = 1.25;

/// Number of rows in one physical node group. `finalize` sweeps one group
/// at a time.
pub const NODE_GROUP_SIZE: u64 = 1 << 17;

/// Masked offsets seeded into a filtered search before graph traversal.
pub const FILTERED_SEARCH_INITIAL_CANDIDATES: usize = 10;

/// Index construction options
#[derive(Debug, Clone, PartialEq)]
pub struct HnswIndexConfig {
    /// Max degree of the upper layer
    pub mu: usize,

    /// Max degree of the lower layer, also the two-hop exploration budget
    pub ml: usize,

    /// Probability of promoting a node into the upper layer
    pub pu: f64,

    /// Construction beam width (efConstruction)
    pub efc: usize,

    /// Diversification factor used when shrinking neighbor lists
    pub alpha: f64,

    /// Distance function
    pub metric: DistanceMetric,

    /// Degree expansion allowed before a node is shrunk
    pub degree_threshold_ratio: f64,

    /// Seed for upper-layer promotion; `None` draws from the OS
    pub seed: Option<u64>,
}

impl Default for HnswIndexConfig {
    fn default() -> Self {
        Self {
            mu: 30,
            ml: 60,
            pu: 0.05,
            efc: 200,
            alpha: 1.1,
            metric: DistanceMetric::Cosine,
            degree_threshold_ratio: DEFAULT_DEGREE_THRESHOLD_RATIO,
            seed: None,
        }
    }
}

impl HnswIndexConfig {
    /// Checks every option for a usable value.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid option.
    pub fn validate(&self) -> Result<()> {
        if self.mu == 0 || self.ml == 0 {
            anyhow::bail!("Degrees must be positive: mu={}, ml={}", self.mu, self.ml);
        }
        if !(0.0..=1.0).contains(&self.pu) {
            anyhow::bail!("Promotion probability pu must be within [0, 1], got {}", self.pu);
        }
        if self.efc == 0 {
            anyhow::bail!("efc must be positive");
        }
        if !self.alpha.is_finite() || self.alpha < 1.0 {
            anyhow::bail!("alpha must be a finite value >= 1.0, got {}", self.alpha);
        }
        if !self.degree_threshold_ratio.is_finite() || self.degree_threshold_ratio < 1.0 {
            anyhow::bail!(
                "degree_threshold_ratio must be a finite value >= 1.0, got {}",
                self.degree_threshold_ratio
            );
        }
        Ok(())
    }

    /// Number of slots in a neighbor row of a layer with max degree `degree`.
    ///
    /// Always at least `degree + 1` so an insert can overflow the bound by one
    /// before the shrink trigger fires.
    #[must_use]
    pub fn degree_threshold_to_shrink(&self, degree: usize) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let scaled = (degree as f64 * self.degree_threshold_ratio).ceil() as usize;
        scaled.max(degree + 1)
    }
}

/// Query-time options
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHnswConfig {
    /// Search beam width (efSearch)
    pub efs: usize,

    /// Below this mask selectivity, filtered search expands two hops blindly
    pub blind_search_up_sel_threshold: f64,

    /// Below this mask selectivity, filtered search expands two hops through
    /// unmasked nodes only
    pub directed_search_up_sel_threshold: f64,
}

impl Default for QueryHnswConfig {
    fn default() -> Self {
        Self { efs: 200, blind_search_up_sel_threshold: 0.08, directed_search_up_sel_threshold: 0.4 }
    }
}

impl QueryHnswConfig {
    /// Checks every option for a usable value.
    ///
    /// # Errors
    ///
    /// Returns an error if `efs` is zero or the selectivity thresholds are
    /// out of `[0, 1]` or out of order.
    pub fn validate(&self) -> Result<()> {
        if self.efs == 0 {
            anyhow::bail!("efs must be positive");
        }
        let blind = self.blind_search_up_sel_threshold;
        let directed = self.directed_search_up_sel_threshold;
        if !(0.0..=1.0).contains(&blind) || !(0.0..=1.0).contains(&directed) {
            anyhow::bail!("Selectivity thresholds must be within [0, 1]: blind={blind}, directed={directed}");
        }
        if blind > directed {
            anyhow::bail!("Blind threshold ({blind}) must not exceed directed threshold ({directed})");
        }
        Ok(())
    }
}
