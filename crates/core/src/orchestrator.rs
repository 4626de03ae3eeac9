//! The deployment pipeline.
//!
//! Drives one target through build, scan, diff and on-chain application as a
//! linear state machine. Progress is persisted to the ledger after every
//! confirmed transaction, so a crashed run resumes from the last durable step
//! instead of repeating it. Transaction submission failures are retried with
//! bounded exponential backoff; hook and validation failures never are.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use alloy_core::primitives::{Address, B256};
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;

use crate::artifacts::ContractArtifact;
use crate::chain::{self, ChainClient, DEFAULT_CREATE3_FACTORY};
use crate::config::{Config, InitArg};
use crate::diff::{self, CutAction, DiamondCutOperation};
use crate::encode;
use crate::error::GemcutError;
use crate::hooks::{self, HookContext};
use crate::interface;
use crate::ledger::{DeploymentLedger, DeploymentRecord};
use crate::scanner::{self, FacetDefinition, ScanOptions};

/// Maximum retry attempts for one transaction submission.
const MAX_TX_ATTEMPTS: usize = 5;

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PipelineState {
    Init,
    PreBuildHook,
    Build,
    PostBuildHook,
    ResolveSignerAndNetwork,
    PreDeployHook,
    DeployPendingFacets,
    ApplyCut,
    CallInitializer,
    PostDeployHook,
    Done,
    Failed,
}

/// Options for one deploy run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Compute and report the plan without sending any transaction.
    pub dry_run: bool,
    /// Allow Replace/Remove operations against core facets.
    pub force_core: bool,
}

/// Summary of a completed (or dry) run.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub target: String,
    pub diamond_address: Address,
    /// The planned cut operations, with addresses filled in as far as the
    /// run got.
    pub operations: Vec<DiamondCutOperation>,
    pub diamond_deployed: bool,
    pub facets_deployed: usize,
    pub cut_tx_hash: Option<B256>,
    pub initialized: bool,
    pub dry_run: bool,
}

/// Result of a standalone build pass.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub facets: Vec<FacetDefinition>,
    pub interface_path: std::path::PathBuf,
}

/// Run the build pipeline alone: build hooks, the build command, the facet
/// scan, a selector-collision check and interface regeneration. Touches no
/// network and no ledger.
pub async fn build(config: &Config) -> Result<BuildReport, GemcutError> {
    let hook_timeout = config.hooks.timeout_secs.map(Duration::from_secs);
    if let Some(command) = &config.hooks.pre_build {
        hooks::run_hook("pre_build", command, None, hook_timeout).await?;
    }
    hooks::run_hook("build", &config.commands.build, None, None).await?;
    if let Some(command) = &config.hooks.post_build {
        hooks::run_hook("post_build", command, None, hook_timeout).await?;
    }

    let core_facets: BTreeSet<String> = config.diamond.core_facets.iter().cloned().collect();
    let scan_options = ScanOptions {
        artifacts_dir: config.paths.artifacts.clone(),
        public_methods: config.diamond.public_methods,
        reserved_names: core_facets.clone(),
    };
    let facets = scanner::scan(&config.paths.src.facets, &scan_options)?;
    // Diff against an empty prior state so collisions fail the build, not the
    // later deploy.
    diff::diff(&facets, None, &core_facets, false)?;
    let interface_path = interface::write_interface(&facets, config)?;

    Ok(BuildReport {
        facets,
        interface_path,
    })
}

/// Executes the deployment pipeline for targets of one configuration.
pub struct Orchestrator<'a> {
    config: &'a Config,
    options: DeployOptions,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, options: DeployOptions) -> Self {
        Self { config, options }
    }

    /// Run the full pipeline for `target_name`.
    ///
    /// `connect` builds the chain client from the lazily resolved RPC URL;
    /// it is only invoked once the run is past the dry-run exit.
    pub async fn deploy<C, F>(
        &self,
        target_name: &str,
        connect: F,
    ) -> Result<DeployReport, GemcutError>
    where
        C: ChainClient,
        F: FnOnce(&str) -> anyhow::Result<C>,
    {
        match self.run(target_name, connect).await {
            Ok(report) => {
                tracing::info!(
                    state = %PipelineState::Done,
                    target = target_name,
                    diamond = %report.diamond_address,
                    "Deployment pipeline finished"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(
                    state = %PipelineState::Failed,
                    target = target_name,
                    error = %err,
                    "Deployment pipeline failed"
                );
                Err(err)
            }
        }
    }

    async fn run<C, F>(&self, target_name: &str, connect: F) -> Result<DeployReport, GemcutError>
    where
        C: ChainClient,
        F: FnOnce(&str) -> anyhow::Result<C>,
    {
        let mut state = PipelineState::Init;
        tracing::info!(state = %state, target = target_name, "Starting deployment pipeline");

        let target = self.config.resolve_target(target_name)?;
        let ledger = DeploymentLedger::new(self.config.paths.generated.deployments.clone());
        let _lease = ledger.acquire(target_name)?;
        let prior = ledger.load(target_name)?;

        let hook_timeout = self.config.hooks.timeout_secs.map(Duration::from_secs);
        let mut hook_context = HookContext {
            target: target.name.clone(),
            network: target.network_name.clone(),
            diamond: prior.as_ref().map(|r| r.diamond_address),
        };

        state = transition(state, PipelineState::PreBuildHook);
        if let Some(command) = &self.config.hooks.pre_build {
            hooks::run_hook("pre_build", command, Some(&hook_context), hook_timeout).await?;
        }

        state = transition(state, PipelineState::Build);
        hooks::run_hook("build", &self.config.commands.build, Some(&hook_context), None).await?;

        state = transition(state, PipelineState::PostBuildHook);
        if let Some(command) = &self.config.hooks.post_build {
            hooks::run_hook("post_build", command, Some(&hook_context), hook_timeout).await?;
        }

        let scan_options = ScanOptions {
            artifacts_dir: self.config.paths.artifacts.clone(),
            public_methods: self.config.diamond.public_methods,
            reserved_names: target.core_facets.clone(),
        };
        let facets = scanner::scan(&self.config.paths.src.facets, &scan_options)?;
        let mut ops = diff::diff(
            &facets,
            prior.as_ref(),
            &target.core_facets,
            self.options.force_core,
        )?;
        interface::write_interface(&facets, self.config)?;

        state = transition(state, PipelineState::ResolveSignerAndNetwork);
        let deployer = target.wallet.resolve_address(&target.wallet_name)?;
        let rpc_url = target
            .network
            .rpc_url
            .resolve(&format!("networks.{}.rpc_url", target.network_name))?;
        let diamond_address = chain::create3_address(DEFAULT_CREATE3_FACTORY, deployer, target.salt);
        if let Some(record) = &prior
            && record.diamond_address != diamond_address
        {
            return Err(GemcutError::Config {
                field: format!("targets.{target_name}.create3_salt"),
                reason: format!(
                    "derived diamond address {diamond_address} does not match recorded {}; \
                     the salt or wallet changed since the first deployment",
                    record.diamond_address
                ),
            });
        }
        hook_context.diamond = Some(diamond_address);

        if self.options.dry_run {
            tracing::info!(
                target = target_name,
                diamond = %diamond_address,
                operations = ops.len(),
                "Dry run, no transactions will be sent"
            );
            return Ok(DeployReport {
                target: target_name.to_string(),
                diamond_address,
                operations: ops,
                diamond_deployed: false,
                facets_deployed: 0,
                cut_tx_hash: None,
                initialized: prior.as_ref().is_some_and(|r| r.initialized),
                dry_run: true,
            });
        }

        // Nothing to cut and nothing left to initialize: a no-change rerun
        // sends zero transactions. The deploy hooks still run so configured
        // verification commands keep firing on every run.
        if ops.is_empty() && prior.as_ref().is_some_and(|r| r.initialized) {
            state = transition(state, PipelineState::PreDeployHook);
            if let Some(command) = &self.config.hooks.pre_deploy {
                hooks::run_hook("pre_deploy", command, Some(&hook_context), hook_timeout).await?;
            }
            state = transition(state, PipelineState::PostDeployHook);
            if let Some(command) = &self.config.hooks.post_deploy {
                hooks::run_hook("post_deploy", command, Some(&hook_context), hook_timeout).await?;
            }
            transition(state, PipelineState::Done);
            tracing::info!(target = target_name, "Deployment is up to date");
            return Ok(DeployReport {
                target: target_name.to_string(),
                diamond_address,
                operations: ops,
                diamond_deployed: false,
                facets_deployed: 0,
                cut_tx_hash: prior.as_ref().and_then(|r| r.last_cut_tx_hash),
                initialized: true,
                dry_run: false,
            });
        }

        let chain_client = connect(&rpc_url).map_err(|e| GemcutError::Transaction {
            stage: state.to_string(),
            reason: format!("failed to connect to `{rpc_url}`: {e:#}"),
        })?;

        // One in-flight run per signer, or concurrent targets sharing a
        // wallet race each other's nonces.
        let lock = signer_lock(deployer);
        let _signer_guard = lock.lock().await;

        state = transition(state, PipelineState::PreDeployHook);
        if let Some(command) = &self.config.hooks.pre_deploy {
            hooks::run_hook("pre_deploy", command, Some(&hook_context), hook_timeout).await?;
        }

        state = transition(state, PipelineState::DeployPendingFacets);
        let mut record =
            prior.unwrap_or_else(|| DeploymentRecord::new(target_name, diamond_address));
        let diamond_deployed = self
            .ensure_diamond(&chain_client, &ledger, &mut record, deployer, target.salt, state)
            .await?;

        let facets_deployed = self
            .deploy_pending_facets(&chain_client, &ledger, &mut record, &facets, &mut ops, deployer, state)
            .await?;

        if !ops.is_empty() {
            state = transition(state, PipelineState::ApplyCut);
            let calldata = encode::encode_diamond_cut(&ops, None)?;
            let tx_hash = with_retry(state, || {
                chain_client.send_transaction(deployer, diamond_address, calldata.clone())
            })
            .await?;
            tracing::info!(tx = %tx_hash, operations = ops.len(), "Diamond cut applied");

            record.last_cut_tx_hash = Some(tx_hash);
            record.last_applied_selectors =
                diff::apply_operations(&record.last_applied_selectors, &ops);
            for op in &ops {
                if op.action != CutAction::Remove
                    && let Some(address) = op.facet_address
                {
                    record
                        .applied_address_by_name
                        .insert(op.facet_name.clone(), address);
                }
            }
            let live: BTreeSet<String> =
                record.last_applied_selectors.keys().cloned().collect();
            record.applied_address_by_name.retain(|name, _| live.contains(name));
            record.updated_at = Utc::now();
            ledger.save(target_name, &record)?;
        }

        if !record.initialized {
            state = transition(state, PipelineState::CallInitializer);
            self.call_initializer(&chain_client, &ledger, &mut record, &target.init_args, deployer, state)
                .await?;
        }

        state = transition(state, PipelineState::PostDeployHook);
        if let Some(command) = &self.config.hooks.post_deploy {
            hooks::run_hook("post_deploy", command, Some(&hook_context), hook_timeout).await?;
        }
        transition(state, PipelineState::Done);

        Ok(DeployReport {
            target: target_name.to_string(),
            diamond_address,
            operations: ops,
            diamond_deployed,
            facets_deployed,
            cut_tx_hash: record.last_cut_tx_hash,
            initialized: record.initialized,
            dry_run: false,
        })
    }

    /// Deploy the diamond proxy through the CREATE3 factory if its
    /// deterministic address holds no code yet.
    async fn ensure_diamond<C: ChainClient>(
        &self,
        chain_client: &C,
        ledger: &DeploymentLedger,
        record: &mut DeploymentRecord,
        deployer: Address,
        salt: B256,
        state: PipelineState,
    ) -> Result<bool, GemcutError> {
        let code = with_retry(state, || chain_client.get_code(record.diamond_address)).await?;
        if !code.is_empty() {
            return Ok(false);
        }

        let artifact = self.load_root_artifact(&self.config.diamond.contract)?;
        let mut creation_code = artifact.bytecode.clone();
        creation_code.extend(encode::encode_constructor_address(deployer));
        let calldata = encode::encode_create3_deploy(salt, &creation_code);

        with_retry(state, || {
            chain_client.send_transaction(deployer, DEFAULT_CREATE3_FACTORY, calldata.clone())
        })
        .await?;

        // The factory deploys to the derived address; verify rather than
        // trust the receipt.
        let deployed = with_retry(state, || chain_client.get_code(record.diamond_address)).await?;
        if deployed.is_empty() {
            return Err(GemcutError::Transaction {
                stage: state.to_string(),
                reason: format!(
                    "CREATE3 factory left no code at {}",
                    record.diamond_address
                ),
            });
        }
        tracing::info!(diamond = %record.diamond_address, "Diamond proxy deployed");

        record.updated_at = Utc::now();
        ledger.save(&record.target_name, record)?;
        Ok(true)
    }

    /// Deploy every facet the cut needs an address for, saving the ledger
    /// after each confirmation.
    #[allow(clippy::too_many_arguments)]
    async fn deploy_pending_facets<C: ChainClient>(
        &self,
        chain_client: &C,
        ledger: &DeploymentLedger,
        record: &mut DeploymentRecord,
        facets: &[FacetDefinition],
        ops: &mut [DiamondCutOperation],
        deployer: Address,
        state: PipelineState,
    ) -> Result<usize, GemcutError> {
        let facet_by_name: HashMap<&str, &FacetDefinition> =
            facets.iter().map(|f| (f.name.as_str(), f)).collect();

        let pending: BTreeSet<String> = ops
            .iter()
            .filter(|op| op.action != CutAction::Remove && op.facet_address.is_none())
            .map(|op| op.facet_name.clone())
            .collect();

        let mut deployed = 0;
        for name in &pending {
            let facet = facet_by_name.get(name.as_str()).ok_or_else(|| {
                GemcutError::Transaction {
                    stage: state.to_string(),
                    reason: format!("facet `{name}` needs deployment but was not scanned"),
                }
            })?;

            let address =
                with_retry(state, || chain_client.deploy_contract(deployer, facet.bytecode.clone()))
                    .await?;
            tracing::info!(facet = %name, address = %address, "Facet deployed");

            record.facet_address_by_name.insert(name.clone(), address);
            record
                .code_fingerprint_by_name
                .insert(name.clone(), facet.code_fingerprint.clone());
            record.updated_at = Utc::now();
            ledger.save(&record.target_name, record)?;
            deployed += 1;

            for op in ops
                .iter_mut()
                .filter(|op| op.facet_name == *name && op.action != CutAction::Remove)
            {
                op.facet_address = Some(address);
            }
        }
        Ok(deployed)
    }

    /// Call the one-time initializer through a `diamondCut` with an empty
    /// operation list, deploying the initializer contract first if needed.
    #[allow(clippy::too_many_arguments)]
    async fn call_initializer<C: ChainClient>(
        &self,
        chain_client: &C,
        ledger: &DeploymentLedger,
        record: &mut DeploymentRecord,
        init_args: &[InitArg],
        deployer: Address,
        state: PipelineState,
    ) -> Result<(), GemcutError> {
        let init = &self.config.diamond.init;
        let artifact = self.load_root_artifact(&init.contract)?;
        let (_, signature) =
            artifact
                .function_by_name(&init.function)
                .ok_or_else(|| GemcutError::Config {
                    field: "diamond.init.function".to_string(),
                    reason: format!(
                        "`{}` must declare exactly one function named `{}`",
                        init.contract, init.function
                    ),
                })?;
        let init_calldata = encode::encode_init_call(signature, init_args, &record.target_name)?;

        let init_address = match record.init_contract_address {
            Some(address) => address,
            None => {
                let address = with_retry(state, || {
                    chain_client.deploy_contract(deployer, artifact.bytecode.clone())
                })
                .await?;
                tracing::info!(contract = %init.contract, address = %address, "Initializer deployed");
                record.init_contract_address = Some(address);
                record.updated_at = Utc::now();
                ledger.save(&record.target_name, record)?;
                address
            }
        };

        let calldata = encode::encode_diamond_cut(&[], Some((init_address, &init_calldata)))?;
        let tx_hash = with_retry(state, || {
            chain_client.send_transaction(deployer, record.diamond_address, calldata.clone())
        })
        .await?;
        tracing::info!(tx = %tx_hash, function = %init.function, "Initializer called");

        record.initialized = true;
        record.updated_at = Utc::now();
        ledger.save(&record.target_name, record)?;
        Ok(())
    }

    /// Load the artifact of a root contract compiled from `<Contract>.sol`.
    fn load_root_artifact(&self, contract: &str) -> Result<ContractArtifact, GemcutError> {
        ContractArtifact::load(
            &self.config.paths.artifacts,
            &format!("{contract}.sol"),
            contract,
        )
    }
}

fn transition(from: PipelineState, to: PipelineState) -> PipelineState {
    tracing::debug!(from = %from, to = %to, "Pipeline state transition");
    to
}

/// Serialize transaction submission per signer address, process-wide.
fn signer_lock(address: Address) -> Arc<AsyncMutex<()>> {
    static LOCKS: OnceLock<StdMutex<HashMap<Address, Arc<AsyncMutex<()>>>>> = OnceLock::new();
    let map = LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut guard = map.lock().expect("signer lock map poisoned");
    guard.entry(address).or_default().clone()
}

/// Retry a chain operation with bounded exponential backoff, classifying the
/// final failure as a transaction error at `stage`.
async fn with_retry<T, F, Fut>(stage: PipelineState, operation: F) -> Result<T, GemcutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    retry_with(
        ExponentialBuilder::default().with_max_times(MAX_TX_ATTEMPTS),
        stage,
        operation,
    )
    .await
}

async fn retry_with<T, F, Fut>(
    backoff: ExponentialBuilder,
    stage: PipelineState,
    operation: F,
) -> Result<T, GemcutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    operation
        .retry(backoff)
        .notify(|err: &anyhow::Error, delay: Duration| {
            tracing::warn!(stage = %stage, error = %err, retry_in = ?delay, "Chain call failed, retrying");
        })
        .await
        .map_err(|e| GemcutError::Transaction {
            stage: stage.to_string(),
            reason: format!("{e:#}"),
        })
}
