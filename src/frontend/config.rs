/// Options recognized by the frontend
pub struct BuildConfig {
    /// Use recorded branch probabilities: a branch arm the profile says
    /// is never taken becomes a synthetic deoptimizing block instead of a
    /// parsed target
    pub use_branch_prediction: bool,

    /// Force constant-pool resolution before use instead of tolerating
    /// unresolved entries (which otherwise degrade to deoptimizing stubs)
    pub eager_resolving: bool,

    /// Emit explicit null/bounds check nodes ahead of trapping field and
    /// array accesses; when off, trapping stays implicit for the
    /// downstream deoptimization machinery
    pub explicit_exception_checks: bool,

    /// Run the local-liveness analysis and prune dead locals from frame
    /// states at block entries
    pub liveness_analysis: bool,

    /// Store deopt-free graphs into the caller-provided cache
    pub cache_graphs: bool,
}

impl BuildConfig {
    pub fn new() -> BuildConfig {
        BuildConfig {
            use_branch_prediction: true,
            eager_resolving: false,
            explicit_exception_checks: true,
            liveness_analysis: true,
            cache_graphs: false,
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig::new()
    }
}
