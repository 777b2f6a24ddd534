//! # hs-optimizer
//!
//! Trial suggestion, pruning and persistent study storage for hypersweep.
//!
//! Provides parameter distributions and suggestion specs, samplers (TPE and
//! random from the `optimizer` engine, plus a store-coordinated grid),
//! pruners (median, no-op), the live trial handle, and SQLite-backed studies
//! that many worker processes can share.

mod distributions;
mod engine;
mod pruners;
mod samplers;
mod storage;
mod study;
mod trial;

pub use distributions::{
    Distribution, ParameterDef, SearchSpace, SuggestSpec, SUPPORTED_DISTRIBUTIONS,
};
pub use pruners::{
    pruner_from_config, MedianPruner, NopPruner, Pruner, PrunerConfig, SUPPORTED_PRUNERS,
};
pub use samplers::{
    sampler_from_config, GridSampler, RandomSampler, Sampler, SamplerConfig, TpeSampler,
    SUPPORTED_SAMPLERS,
};
pub use storage::{StudyId, StudyStorage, TrialId};
pub use study::{Budget, OptimizeSummary, Study, StudyConfig};
pub use trial::{FrozenTrial, Trial};
