//! Persisted per-target deployment state.
//!
//! The ledger is a JSON file mapping target name to the latest
//! [`DeploymentRecord`]. It is read fully before every run and rewritten
//! atomically (write-temp-then-rename) after each durable step, so a crash
//! mid-save leaves the prior record readable. Concurrent writers to one
//! target are excluded by an advisory file lock held for the run duration.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::GemcutError;
use crate::scanner::Selector;

/// The authoritative record of what has been deployed for one target.
///
/// `facet_address_by_name` only ever contains facets whose deployment
/// transaction was confirmed; entries are written one at a time, immediately
/// on confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub target_name: String,
    /// Deterministic diamond proxy address.
    pub diamond_address: Address,
    /// Confirmed facet deployments (the deployment pool). A facet can be
    /// deployed here before any cut routes selectors to it.
    #[serde(default)]
    pub facet_address_by_name: BTreeMap<String, Address>,
    /// Bytecode fingerprint of each confirmed facet deployment.
    #[serde(default)]
    pub code_fingerprint_by_name: BTreeMap<String, String>,
    /// Facet address each facet's selectors were routed to by the last
    /// confirmed cut. Diverges from `facet_address_by_name` when a run
    /// crashed between a facet redeployment and its cut.
    #[serde(default)]
    pub applied_address_by_name: BTreeMap<String, Address>,
    /// Confirmed initializer contract, if deployed.
    #[serde(default)]
    pub init_contract_address: Option<Address>,
    /// Hash of the last confirmed diamond-cut transaction.
    #[serde(default)]
    pub last_cut_tx_hash: Option<B256>,
    /// Selector routing state as of the last confirmed cut.
    #[serde(default)]
    pub last_applied_selectors: BTreeMap<String, Vec<Selector>>,
    /// Whether the one-time initializer has been called.
    #[serde(default)]
    pub initialized: bool,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// A fresh record for a target whose diamond address has been derived but
    /// where nothing has been confirmed on chain yet.
    pub fn new(target_name: &str, diamond_address: Address) -> Self {
        Self {
            target_name: target_name.to_string(),
            diamond_address,
            facet_address_by_name: BTreeMap::new(),
            code_fingerprint_by_name: BTreeMap::new(),
            applied_address_by_name: BTreeMap::new(),
            init_contract_address: None,
            last_cut_tx_hash: None,
            last_applied_selectors: BTreeMap::new(),
            initialized: false,
            updated_at: Utc::now(),
        }
    }
}

/// Exclusive per-target lease. Released on drop.
///
/// The lock file itself is left in place: unlinking it would let a later
/// acquirer lock a fresh inode under the same path while a contender still
/// holds the orphaned one.
#[derive(Debug)]
pub struct LedgerLease {
    lock_file: File,
}

impl Drop for LedgerLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// Handle to the on-disk deployment ledger.
#[derive(Debug, Clone)]
pub struct DeploymentLedger {
    path: PathBuf,
}

impl DeploymentLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the exclusive lease for `target`.
    ///
    /// Fails immediately (no blocking) when another run holds it.
    pub fn acquire(&self, target: &str) -> Result<LedgerLease, GemcutError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| GemcutError::LedgerCorruption {
                path: self.path.clone(),
                reason: format!("failed to create ledger directory: {e}"),
            })?;
        }

        let lock_path = self.lock_path(target);
        let lock_file = File::create(&lock_path).map_err(|e| GemcutError::LedgerCorruption {
            path: lock_path.clone(),
            reason: format!("failed to create lease file: {e}"),
        })?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| GemcutError::TargetLocked {
                target: target.to_string(),
            })?;

        tracing::debug!(target, path = %lock_path.display(), "Ledger lease acquired");
        Ok(LedgerLease { lock_file })
    }

    /// Load the latest record for `target`, if any.
    ///
    /// A missing ledger file means no deployment has happened; an unreadable
    /// one is corruption and is never silently reset.
    pub fn load(&self, target: &str) -> Result<Option<DeploymentRecord>, GemcutError> {
        Ok(self.read_all()?.remove(target))
    }

    /// Atomically persist `record` as the latest state of `target`.
    pub fn save(&self, target: &str, record: &DeploymentRecord) -> Result<(), GemcutError> {
        let mut all = self.read_all()?;
        all.insert(target.to_string(), record.clone());

        let json = serde_json::to_string_pretty(&all).map_err(|e| {
            GemcutError::LedgerCorruption {
                path: self.path.clone(),
                reason: format!("failed to serialize ledger: {e}"),
            }
        })?;

        // Write-temp-then-rename so a crash never leaves a partial ledger.
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| GemcutError::LedgerCorruption {
            path: tmp_path.clone(),
            reason: format!("failed to write ledger: {e}"),
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| GemcutError::LedgerCorruption {
            path: self.path.clone(),
            reason: format!("failed to commit ledger: {e}"),
        })?;

        tracing::debug!(target, path = %self.path.display(), "Ledger saved");
        Ok(())
    }

    fn read_all(&self) -> Result<BTreeMap<String, DeploymentRecord>, GemcutError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            GemcutError::LedgerCorruption {
                path: self.path.clone(),
                reason: format!("failed to read ledger: {e}"),
            }
        })?;
        serde_json::from_str(&raw).map_err(|e| GemcutError::LedgerCorruption {
            path: self.path.clone(),
            reason: format!("ledger is not valid JSON: {e}"),
        })
    }

    fn lock_path(&self, target: &str) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "ledger".to_string());
        self.path
            .with_file_name(format!(".{file_name}.{target}.lock"))
    }
}
