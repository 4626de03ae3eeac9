//! gemcut-core - Build and deployment library for EIP-2535 diamond proxies.
//!
//! This crate drives a diamond project from Solidity sources to a live,
//! upgradable proxy: it scans facet contracts for their exposed selectors,
//! diffs them against the last recorded deployment, generates the aggregate
//! `IDiamondProxy` interface and applies the resulting `diamondCut` through
//! a CREATE3-deterministic diamond address.

pub mod artifacts;
pub mod chain;
pub mod config;
pub mod diff;
pub mod encode;
pub mod error;
pub mod hooks;
pub mod interface;
pub mod ledger;
pub mod orchestrator;
pub mod scanner;

pub use artifacts::ContractArtifact;
pub use chain::{ChainClient, DEFAULT_CREATE3_FACTORY, JsonRpcClient, create3_address};
pub use config::{Config, GEMCUT_FILENAME, LazyValue, ResolvedTarget, WalletSpec};
pub use diff::{CutAction, DiamondCutOperation};
pub use error::GemcutError;
pub use ledger::{DeploymentLedger, DeploymentRecord, LedgerLease};
pub use orchestrator::{
    BuildReport, DeployOptions, DeployReport, Orchestrator, PipelineState, build,
};
pub use scanner::{FacetDefinition, ScanOptions, Selector};
