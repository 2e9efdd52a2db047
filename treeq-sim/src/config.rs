//! Register configuration

/// Construction-time configuration for a simulated register
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Decorate reset and measurement with a random global phase
    ///
    /// Global phase is unobservable, so randomizing it is free and shakes out
    /// accidental phase dependence in callers.
    ///
    /// Default: false
    pub random_global_phase: bool,

    /// Renormalize automatically when the post-gate norm drifts
    ///
    /// When false, drift beyond `norm_tolerance` surfaces as an error
    /// instead.
    ///
    /// Default: true
    pub do_normalize: bool,

    /// Allowed deviation of the squared norm from 1
    ///
    /// Default: 1e-9
    pub norm_tolerance: f64,

    /// Squared amplitude magnitude at or below which a subtree counts as zero
    ///
    /// Zero subtrees are skipped during traversal and collapsed to the
    /// canonical zero node during pruning.
    ///
    /// Default: 1e-24
    pub amplitude_floor: f64,

    /// Residual squared norm tolerated when factoring a range out of a state
    ///
    /// Default: 1e-12
    pub separability_threshold: f64,

    /// Minimum enumeration range before path traversals go parallel
    ///
    /// Default: 64
    pub parallel_threshold: u64,

    /// Device the register's engines are created on
    ///
    /// Default: 0
    pub device_id: usize,

    /// Random number generator seed for reproducibility
    ///
    /// If None, the generator is seeded from OS entropy.
    ///
    /// Default: None (entropy)
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            random_global_phase: false,
            do_normalize: true,
            norm_tolerance: 1e-9,
            amplitude_floor: 1e-24,
            separability_threshold: 1e-12,
            parallel_threshold: 64,
            device_id: 0,
            seed: None,
        }
    }
}

impl SimConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the random global phase
    pub fn with_random_global_phase(mut self, enabled: bool) -> Self {
        self.random_global_phase = enabled;
        self
    }

    /// Enable or disable automatic renormalization
    pub fn with_normalization(mut self, enabled: bool) -> Self {
        self.do_normalize = enabled;
        self
    }

    /// Set the amplitude floor
    pub fn with_amplitude_floor(mut self, floor: f64) -> Self {
        self.amplitude_floor = floor;
        self
    }

    /// Set the separability threshold
    pub fn with_separability_threshold(mut self, threshold: f64) -> Self {
        self.separability_threshold = threshold;
        self
    }

    /// Set the random seed for deterministic sampling
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the device engines are created on
    pub fn with_device(mut self, device_id: usize) -> Self {
        self.device_id = device_id;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(self.amplitude_floor >= 0.0) {
            return Err(format!(
                "amplitude_floor must be non-negative, got {}",
                self.amplitude_floor
            ));
        }
        if !(self.norm_tolerance > 0.0) {
            return Err(format!(
                "norm_tolerance must be positive, got {}",
                self.norm_tolerance
            ));
        }
        if !(self.separability_threshold > 0.0) {
            return Err(format!(
                "separability_threshold must be positive, got {}",
                self.separability_threshold
            ));
        }
        Ok(())
    }
}
