//! Error taxonomy for gemcut.
//!
//! Every fatal error carries enough context (field, facet, selector, pipeline
//! stage) for a rerun to resume precisely. Transient transaction faults are
//! retried inside the orchestrator and only surface here once retries are
//! exhausted.

use std::path::PathBuf;

use crate::scanner::Selector;

/// Top-level error type for all gemcut operations.
#[derive(Debug, thiserror::Error)]
pub enum GemcutError {
    /// Missing or structurally invalid configuration reference.
    #[error("invalid configuration field `{field}`: {reason}")]
    Config { field: String, reason: String },

    /// A source file or build artifact could not be scanned.
    #[error("failed to scan {}: {reason}", path.display())]
    Scan { path: PathBuf, reason: String },

    /// Two source files yielded the same facet contract name.
    #[error("duplicate facet `{name}`: declared in both {} and {}", first.display(), second.display())]
    DuplicateFacet {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// One selector is claimed by two distinct active facets.
    #[error(
        "selector collision on {selector} (`{signature}`): claimed by both `{first}` and `{second}`"
    )]
    SelectorCollision {
        selector: Selector,
        signature: String,
        first: String,
        second: String,
    },

    /// A lifecycle hook or the build command exited with a non-zero status.
    #[error("hook `{hook}` failed with exit code {code}:\n{output}")]
    HookFailure {
        hook: String,
        code: i32,
        output: String,
    },

    /// A transactional step failed after exhausting its retry budget.
    #[error("transaction failed during {stage}: {reason}")]
    Transaction { stage: String, reason: String },

    /// The persisted deployment ledger is unreadable or inconsistent.
    ///
    /// Never silently reset; manual intervention is required.
    #[error("deployment ledger at {} is corrupted: {reason}", path.display())]
    LedgerCorruption { path: PathBuf, reason: String },

    /// Another gemcut run holds the lease for this target.
    #[error("target `{target}` is locked by another gemcut run")]
    TargetLocked { target: String },
}

impl GemcutError {
    /// Process exit code for this error class.
    ///
    /// Distinct codes let callers tell config errors, collisions and
    /// transaction failures apart without parsing output.
    pub fn exit_code(&self) -> i32 {
        match self {
            GemcutError::Config { .. } => 2,
            GemcutError::Scan { .. } | GemcutError::DuplicateFacet { .. } => 3,
            GemcutError::SelectorCollision { .. } => 4,
            GemcutError::HookFailure { .. } => 5,
            GemcutError::Transaction { .. } => 6,
            GemcutError::LedgerCorruption { .. } | GemcutError::TargetLocked { .. } => 7,
        }
    }
}
