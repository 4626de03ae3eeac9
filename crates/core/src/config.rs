//! Declarative configuration for gemcut.
//!
//! The configuration lives in `gemcut.toml` and is loaded through figment so
//! that any field can be overridden from `GEMCUT_`-prefixed environment
//! variables. Secrets (mnemonics, RPC URLs) may be declared as lazy
//! environment references that are resolved only at the point of use, never
//! during validation — scanning and diffing run without live credentials.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use alloy_core::primitives::{Address, B256};
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};

use crate::error::GemcutError;

/// The default name for the gemcut configuration file.
pub const GEMCUT_FILENAME: &str = "gemcut.toml";

/// A configuration value that is either a literal or a deferred environment
/// lookup.
///
/// Environment references are resolved only when [`LazyValue::resolve`] is
/// called, and resolved values must never be written into generated artifacts
/// or the deployment ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LazyValue {
    /// Deferred lookup: `{ env = "SEPOLIA_RPC_URL" }`.
    Env { env: String },
    /// Inline literal value.
    Literal(String),
}

impl LazyValue {
    /// Resolve the value, reading the environment if necessary.
    pub fn resolve(&self, field: &str) -> Result<String, GemcutError> {
        match self {
            LazyValue::Literal(value) => Ok(value.clone()),
            LazyValue::Env { env } => std::env::var(env).map_err(|_| GemcutError::Config {
                field: field.to_string(),
                reason: format!("environment variable `{env}` is not set"),
            }),
        }
    }
}

/// Solidity metadata inserted into generated sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolcConfig {
    /// SPDX license identifier for generated `.sol` files.
    pub license: String,
    /// Solidity compiler version pragma for generated `.sol` files.
    pub version: String,
}

impl Default for SolcConfig {
    fn default() -> Self {
        Self {
            license: "MIT".to_string(),
            version: "0.8.21".to_string(),
        }
    }
}

/// External commands invoked by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// The build command that compiles facets into artifacts.
    pub build: String,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            build: "forge build".to_string(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Folder holding compiled build artifacts.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts: PathBuf,
    /// Source file patterns.
    pub src: SrcPaths,
    /// Output locations for gemcut-generated files.
    #[serde(default)]
    pub generated: GeneratedPaths,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("out")
}

/// Source patterns for facet discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcPaths {
    /// Glob patterns matched against facet source files, in declared order.
    pub facets: Vec<String>,
}

/// Output locations for generated files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPaths {
    /// Output path for the generated aggregate interface.
    pub interface: PathBuf,
    /// Deployment ledger file.
    pub deployments: PathBuf,
}

impl Default for GeneratedPaths {
    fn default() -> Self {
        Self {
            interface: PathBuf::from("src/generated/IDiamondProxy.sol"),
            deployments: PathBuf::from("gemcut.deployments.json"),
        }
    }
}

/// Options for the generated proxy interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub proxy_interface: ProxyInterfaceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyInterfaceConfig {
    /// Extra imports included in the generated interface, in declared order.
    #[serde(default)]
    pub imports: Vec<String>,
}

/// Diamond proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiamondConfig {
    /// Include `public` functions in scanning and interface generation.
    /// Default is `external` functions only.
    #[serde(default)]
    pub public_methods: bool,
    /// The diamond proxy contract deployed on first run.
    #[serde(default = "default_diamond_contract")]
    pub contract: String,
    /// One-time initializer called on first deployment.
    pub init: InitConfig,
    /// Core facet names: never modified or removed automatically once
    /// deployed, and reserved against reuse by scanned facets.
    #[serde(default = "default_core_facets")]
    pub core_facets: Vec<String>,
}

fn default_diamond_contract() -> String {
    "Diamond".to_string()
}

fn default_core_facets() -> Vec<String> {
    vec![
        "OwnershipFacet".to_string(),
        "DiamondCutFacet".to_string(),
        "DiamondLoupeFacet".to_string(),
    ]
}

impl Default for DiamondConfig {
    fn default() -> Self {
        Self {
            public_methods: false,
            contract: default_diamond_contract(),
            init: InitConfig::default(),
            core_facets: default_core_facets(),
        }
    }
}

/// The diamond initialization contract and function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    pub contract: String,
    pub function: String,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            contract: "InitDiamond".to_string(),
            function: "init".to_string(),
        }
    }
}

/// Lifecycle hooks: shell commands executed around the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HooksConfig {
    pub pre_build: Option<String>,
    pub post_build: Option<String>,
    pub pre_deploy: Option<String>,
    pub post_deploy: Option<String>,
    /// Optional per-hook timeout. A hook exceeding it is killed and the run
    /// fails; without it the pipeline blocks until the hook exits.
    pub timeout_secs: Option<u64>,
}

/// A signer specification. The secret material is resolved lazily.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WalletSpec {
    /// BIP-39 mnemonic with a 0-based account index.
    Mnemonic {
        words: LazyValue,
        #[serde(default)]
        index: u32,
    },
    /// Raw hex private key.
    PrivateKey { key: LazyValue },
}

impl WalletSpec {
    /// Resolve the signer. This is the only point where wallet secrets are
    /// read.
    pub fn resolve_signer(&self, wallet_name: &str) -> Result<PrivateKeySigner, GemcutError> {
        let field = format!("wallets.{wallet_name}");
        match self {
            WalletSpec::Mnemonic { words, index } => {
                let phrase = words.resolve(&field)?;
                MnemonicBuilder::<English>::default()
                    .phrase(phrase)
                    .index(*index)
                    .and_then(|b| b.build())
                    .map_err(|e| GemcutError::Config {
                        field,
                        reason: format!("invalid mnemonic wallet: {e}"),
                    })
            }
            WalletSpec::PrivateKey { key } => {
                let raw = key.resolve(&field)?;
                raw.trim_start_matches("0x")
                    .parse::<PrivateKeySigner>()
                    .map_err(|e| GemcutError::Config {
                        field,
                        reason: format!("invalid private key: {e}"),
                    })
            }
        }
    }

    /// The signer address, without exposing key material to the caller.
    pub fn resolve_address(&self, wallet_name: &str) -> Result<Address, GemcutError> {
        let signer = self.resolve_signer(wallet_name)?;
        // alloy-signer-local carries its own primitives version; go through
        // raw bytes to stay on the workspace alloy-core types.
        Ok(Address::from_slice(signer.address().as_slice()))
    }
}

/// A network specification: an RPC endpoint, possibly lazily resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub rpc_url: LazyValue,
}

/// A single initializer argument. Only statically encodable values are
/// supported: addresses, 32-byte words and unsigned integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitArg {
    Uint(u64),
    Str(String),
}

/// A deployment target: one (network, wallet, init, salt) destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Named network reference.
    pub network: String,
    /// Named wallet reference.
    pub wallet: String,
    /// Initializer arguments, passed in declared order.
    #[serde(default)]
    pub init_args: Vec<InitArg>,
    /// 32-byte CREATE3 salt, hex encoded.
    pub create3_salt: String,
    /// Per-target override of the core facet names.
    #[serde(default)]
    pub core_facets: Option<Vec<String>>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub solc: SolcConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub diamond: DiamondConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub wallets: BTreeMap<String, WalletSpec>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSpec>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetSpec>,
}

/// A validated target with its references resolved to concrete specs.
///
/// Lazy fields inside `network` and `wallet` remain unresolved; they are
/// invoked downstream at signer construction and RPC dial.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub name: String,
    pub network_name: String,
    pub network: NetworkSpec,
    pub wallet_name: String,
    pub wallet: WalletSpec,
    pub init_args: Vec<InitArg>,
    pub salt: B256,
    pub core_facets: BTreeSet<String>,
}

impl Config {
    /// Load the configuration from a TOML file, with `GEMCUT_`-prefixed
    /// environment overrides applied on top.
    pub fn load(path: &Path) -> Result<Self, GemcutError> {
        if !path.exists() {
            return Err(GemcutError::Config {
                field: path.display().to_string(),
                reason: "configuration file not found".to_string(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GEMCUT_").split("__"))
            .extract()
            .map_err(|e| GemcutError::Config {
                field: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Structural validation that does not touch any lazy value.
    fn validate(&self) -> Result<(), GemcutError> {
        if self.paths.src.facets.is_empty() {
            return Err(GemcutError::Config {
                field: "paths.src.facets".to_string(),
                reason: "at least one facet source pattern is required".to_string(),
            });
        }
        if self.paths.src.facets.iter().any(|p| p.trim().is_empty()) {
            return Err(GemcutError::Config {
                field: "paths.src.facets".to_string(),
                reason: "facet source patterns must be non-empty".to_string(),
            });
        }
        for (name, target) in &self.targets {
            if !self.networks.contains_key(&target.network) {
                return Err(GemcutError::Config {
                    field: format!("targets.{name}.network"),
                    reason: format!("unknown network `{}`", target.network),
                });
            }
            if !self.wallets.contains_key(&target.wallet) {
                return Err(GemcutError::Config {
                    field: format!("targets.{name}.wallet"),
                    reason: format!("unknown wallet `{}`", target.wallet),
                });
            }
        }
        Ok(())
    }

    /// Resolve a named target, validating every reference it carries.
    pub fn resolve_target(&self, target_name: &str) -> Result<ResolvedTarget, GemcutError> {
        let target = self
            .targets
            .get(target_name)
            .ok_or_else(|| GemcutError::Config {
                field: format!("targets.{target_name}"),
                reason: "target is not declared".to_string(),
            })?;

        let network = self
            .networks
            .get(&target.network)
            .ok_or_else(|| GemcutError::Config {
                field: format!("targets.{target_name}.network"),
                reason: format!("unknown network `{}`", target.network),
            })?;
        let wallet = self
            .wallets
            .get(&target.wallet)
            .ok_or_else(|| GemcutError::Config {
                field: format!("targets.{target_name}.wallet"),
                reason: format!("unknown wallet `{}`", target.wallet),
            })?;

        let salt: B256 =
            target
                .create3_salt
                .parse()
                .map_err(|e| GemcutError::Config {
                    field: format!("targets.{target_name}.create3_salt"),
                    reason: format!("expected a 32-byte hex salt: {e}"),
                })?;

        let core_facets: BTreeSet<String> = target
            .core_facets
            .clone()
            .unwrap_or_else(|| self.diamond.core_facets.clone())
            .into_iter()
            .collect();

        Ok(ResolvedTarget {
            name: target_name.to_string(),
            network_name: target.network.clone(),
            network: network.clone(),
            wallet_name: target.wallet.clone(),
            wallet: wallet.clone(),
            init_args: target.init_args.clone(),
            salt,
            core_facets,
        })
    }
}
