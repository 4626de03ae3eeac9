//! Diamond-cut diff computation.
//!
//! Compares the freshly scanned facet set against the last recorded
//! deployment state and produces the minimal ordered list of
//! Add/Replace/Remove operations. Cut transactions are gas-costed, so an
//! unchanged selector must never be re-added.

use std::collections::{BTreeMap, BTreeSet};

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::error::GemcutError;
use crate::ledger::DeploymentRecord;
use crate::scanner::{FacetDefinition, Selector};

/// The three diamond-cut actions.
///
/// Variant order doubles as emission order: a selector freed by a Remove can
/// never spuriously collide with an Add in the same cut.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
)]
pub enum CutAction {
    Remove,
    Replace,
    Add,
}

impl CutAction {
    /// The on-chain `IDiamondCut.FacetCutAction` encoding.
    pub fn chain_value(&self) -> u8 {
        match self {
            CutAction::Add => 0,
            CutAction::Replace => 1,
            CutAction::Remove => 2,
        }
    }
}

/// One entry of the diamond-cut operation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiamondCutOperation {
    pub facet_name: String,
    /// Known for facets whose confirmed address can be reused; `None` until
    /// the orchestrator deploys (or redeploys) the facet. Removes always
    /// carry `None` (the cut routes them to the zero address).
    pub facet_address: Option<Address>,
    pub action: CutAction,
    /// Ascending selector order.
    pub selectors: Vec<Selector>,
}

/// Compute the minimal ordered operation list for `current` against `prior`.
///
/// Fails with [`GemcutError::SelectorCollision`] before emitting anything if
/// two active facets claim the same selector. Core facets are never the
/// subject of an automatic Remove or Replace unless `force_core` is set.
pub fn diff(
    current: &[FacetDefinition],
    prior: Option<&DeploymentRecord>,
    core_facets: &BTreeSet<String>,
    force_core: bool,
) -> Result<Vec<DiamondCutOperation>, GemcutError> {
    detect_collisions(current)?;

    let empty_selectors = BTreeMap::new();
    let empty_fingerprints = BTreeMap::new();
    let empty_addresses = BTreeMap::new();
    let (prior_selectors, prior_fingerprints, prior_addresses, prior_applied) = match prior {
        Some(record) => (
            &record.last_applied_selectors,
            &record.code_fingerprint_by_name,
            Some(&record.facet_address_by_name),
            &record.applied_address_by_name,
        ),
        None => (&empty_selectors, &empty_fingerprints, None, &empty_addresses),
    };

    let mut ops = Vec::new();

    for (order, facet) in current.iter().enumerate() {
        let protected = core_facets.contains(&facet.name) && !force_core;
        let current_set: BTreeSet<Selector> = facet.selectors.iter().copied().collect();
        let prior_set: BTreeSet<Selector> = prior_selectors
            .get(&facet.name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();

        // A facet never cut before has no redeploy question: everything is
        // an Add. Otherwise the recorded fingerprint decides whether its
        // continuing selectors must be re-routed to fresh bytecode.
        let fingerprint_changed = !prior_set.is_empty()
            && prior_fingerprints.get(&facet.name) != Some(&facet.code_fingerprint);

        let known_address = (!fingerprint_changed)
            .then(|| prior_addresses.and_then(|m| m.get(&facet.name).copied()))
            .flatten();

        // An interrupted earlier run can leave a freshly deployed facet in
        // the pool while the last cut still routes to its predecessor. The
        // continuing selectors then need a Replace even though the scanned
        // fingerprint matches the pool entry.
        let stale_routing = !fingerprint_changed
            && !prior_set.is_empty()
            && match (known_address, prior_applied.get(&facet.name)) {
                (Some(pool), Some(applied)) => pool != *applied,
                _ => false,
            };

        let adds: Vec<Selector> = current_set.difference(&prior_set).copied().collect();
        let removes: Vec<Selector> = prior_set.difference(&current_set).copied().collect();
        let replaces: Vec<Selector> = if fingerprint_changed || stale_routing {
            current_set.intersection(&prior_set).copied().collect()
        } else {
            Vec::new()
        };

        if !removes.is_empty() && !protected {
            ops.push((order, DiamondCutOperation {
                facet_name: facet.name.clone(),
                facet_address: None,
                action: CutAction::Remove,
                selectors: removes,
            }));
        }
        if !replaces.is_empty() && !protected {
            ops.push((order, DiamondCutOperation {
                facet_name: facet.name.clone(),
                facet_address: known_address,
                action: CutAction::Replace,
                selectors: replaces,
            }));
        }
        if !adds.is_empty() {
            ops.push((order, DiamondCutOperation {
                facet_name: facet.name.clone(),
                facet_address: known_address,
                action: CutAction::Add,
                selectors: adds,
            }));
        }
    }

    // Facets recorded in the prior state but absent from the scan lose all
    // their selectors. They come after the scanned facets in discovery
    // order; BTreeMap iteration keeps them deterministic.
    let current_names: BTreeSet<&str> = current.iter().map(|f| f.name.as_str()).collect();
    let mut vanished_order = current.len();
    for (name, selectors) in prior_selectors {
        if current_names.contains(name.as_str()) || selectors.is_empty() {
            continue;
        }
        if core_facets.contains(name) && !force_core {
            tracing::debug!(facet = %name, "Skipping removal of core facet");
            continue;
        }
        let mut sorted = selectors.clone();
        sorted.sort();
        ops.push((vanished_order, DiamondCutOperation {
            facet_name: name.clone(),
            facet_address: None,
            action: CutAction::Remove,
            selectors: sorted,
        }));
        vanished_order += 1;
    }

    // A selector can also collide with a facet that stays active from the
    // prior record without being scanned, typically a protected core facet.
    // Check every Add against the owners surviving this cut.
    detect_prior_owner_collisions(current, prior_selectors, &ops)?;

    // Removes, then Replaces, then Adds; discovery order within an action.
    ops.sort_by(|(ao, a), (bo, b)| a.action.cmp(&b.action).then(ao.cmp(bo)));
    Ok(ops.into_iter().map(|(_, op)| op).collect())
}

/// Reject an Add whose selector is still owned, after this cut, by a facet
/// that was not part of the scan.
fn detect_prior_owner_collisions(
    current: &[FacetDefinition],
    prior_selectors: &BTreeMap<String, Vec<Selector>>,
    ops: &[(usize, DiamondCutOperation)],
) -> Result<(), GemcutError> {
    let mut removed_by_facet: BTreeMap<&str, BTreeSet<Selector>> = BTreeMap::new();
    for (_, op) in ops.iter().filter(|(_, op)| op.action == CutAction::Remove) {
        removed_by_facet
            .entry(op.facet_name.as_str())
            .or_default()
            .extend(op.selectors.iter().copied());
    }

    let mut surviving_owner: BTreeMap<Selector, &str> = BTreeMap::new();
    for (name, selectors) in prior_selectors {
        let removed = removed_by_facet.get(name.as_str());
        for selector in selectors {
            if !removed.is_some_and(|r| r.contains(selector)) {
                surviving_owner.insert(*selector, name.as_str());
            }
        }
    }

    for (_, op) in ops.iter().filter(|(_, op)| op.action == CutAction::Add) {
        for selector in &op.selectors {
            if let Some(owner) = surviving_owner.get(selector)
                && *owner != op.facet_name
            {
                let signature = current
                    .iter()
                    .find(|f| f.name == op.facet_name)
                    .and_then(|f| f.signature_by_selector.get(selector))
                    .cloned()
                    .unwrap_or_default();
                return Err(GemcutError::SelectorCollision {
                    selector: *selector,
                    signature,
                    first: owner.to_string(),
                    second: op.facet_name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Enforce global selector uniqueness across all active facets.
fn detect_collisions(current: &[FacetDefinition]) -> Result<(), GemcutError> {
    let mut owner_by_selector: BTreeMap<Selector, &FacetDefinition> = BTreeMap::new();
    for facet in current {
        for selector in &facet.selectors {
            if let Some(owner) = owner_by_selector.get(selector) {
                let signature = facet
                    .signature_by_selector
                    .get(selector)
                    .cloned()
                    .unwrap_or_default();
                return Err(GemcutError::SelectorCollision {
                    selector: *selector,
                    signature,
                    first: owner.name.clone(),
                    second: facet.name.clone(),
                });
            }
            owner_by_selector.insert(*selector, facet);
        }
    }
    Ok(())
}

/// The selector routing state after `ops` have been applied on top of
/// `prior`. This is what the ledger records as `last_applied_selectors`.
pub fn apply_operations(
    prior: &BTreeMap<String, Vec<Selector>>,
    ops: &[DiamondCutOperation],
) -> BTreeMap<String, Vec<Selector>> {
    let mut state: BTreeMap<String, BTreeSet<Selector>> = prior
        .iter()
        .map(|(name, sels)| (name.clone(), sels.iter().copied().collect()))
        .collect();

    for op in ops {
        let entry = state.entry(op.facet_name.clone()).or_default();
        match op.action {
            CutAction::Add => entry.extend(op.selectors.iter().copied()),
            CutAction::Remove => {
                for selector in &op.selectors {
                    entry.remove(selector);
                }
            }
            // Replace re-routes a selector to new bytecode; set unchanged.
            CutAction::Replace => {}
        }
    }

    state
        .into_iter()
        .filter(|(_, sels)| !sels.is_empty())
        .map(|(name, sels)| (name, sels.into_iter().collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::primitives::address;
    use std::path::PathBuf;

    fn sel(value: u32) -> Selector {
        Selector::from(value.to_be_bytes())
    }

    fn facet(name: &str, fingerprint: &str, selectors: &[(u32, &str)]) -> FacetDefinition {
        let signature_by_selector: BTreeMap<Selector, String> = selectors
            .iter()
            .map(|(v, sig)| (sel(*v), sig.to_string()))
            .collect();
        FacetDefinition {
            name: name.to_string(),
            source_path: PathBuf::from(format!("src/facets/{name}.sol")),
            selectors: signature_by_selector.keys().copied().collect(),
            declaration_by_selector: BTreeMap::new(),
            signature_by_selector,
            code_fingerprint: fingerprint.to_string(),
            bytecode: vec![0x60],
        }
    }

    fn record_with(facets: &[(&str, &str, &[u32])]) -> DeploymentRecord {
        let mut record = DeploymentRecord::new(
            "local",
            address!("93FEC2C00BfE902F733B57c5a6CeeD7CD1384AE1"),
        );
        for (name, fingerprint, selectors) in facets {
            record.last_applied_selectors.insert(
                name.to_string(),
                selectors.iter().map(|v| sel(*v)).collect(),
            );
            record
                .code_fingerprint_by_name
                .insert(name.to_string(), fingerprint.to_string());
            record.facet_address_by_name.insert(
                name.to_string(),
                address!("70997970C51812dc3A010C7d01b50e0d17dc79C8"),
            );
            record.applied_address_by_name.insert(
                name.to_string(),
                address!("70997970C51812dc3A010C7d01b50e0d17dc79C8"),
            );
        }
        record
    }

    fn no_core() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_first_deployment_is_all_adds() {
        let current = vec![
            facet("AFacet", "f1", &[(1, "a()"), (2, "b()")]),
            facet("BFacet", "f2", &[(3, "c()")]),
        ];
        let ops = diff(&current, None, &no_core(), false).unwrap();

        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.action == CutAction::Add));
        assert_eq!(ops[0].facet_name, "AFacet");
        assert_eq!(ops[0].selectors, vec![sel(1), sel(2)]);
        assert_eq!(ops[1].facet_name, "BFacet");
    }

    #[test]
    fn test_unchanged_state_yields_empty_diff() {
        let current = vec![facet("AFacet", "f1", &[(1, "a()"), (2, "b()")])];
        let prior = record_with(&[("AFacet", "f1", &[1, 2])]);

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_selector_delta_is_minimal() {
        // Selector 2 stays, 1 is dropped, 3 is new; bytecode unchanged.
        let current = vec![facet("AFacet", "f1", &[(2, "b()"), (3, "c()")])];
        let prior = record_with(&[("AFacet", "f1", &[1, 2])]);

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].action, CutAction::Remove);
        assert_eq!(ops[0].selectors, vec![sel(1)]);
        assert_eq!(ops[1].action, CutAction::Add);
        assert_eq!(ops[1].selectors, vec![sel(3)]);
        // The unchanged selector 2 appears nowhere.
        assert!(ops.iter().all(|op| !op.selectors.contains(&sel(2))));
        // The facet's confirmed address is reusable for the Add.
        assert!(ops[1].facet_address.is_some());
    }

    #[test]
    fn test_fingerprint_change_emits_replace() {
        let current = vec![facet("AFacet", "f2", &[(1, "a()"), (3, "c()")])];
        let prior = record_with(&[("AFacet", "f1", &[1, 2])]);

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        assert_eq!(
            ops.iter().map(|op| op.action).collect::<Vec<_>>(),
            vec![CutAction::Remove, CutAction::Replace, CutAction::Add]
        );
        assert_eq!(ops[1].selectors, vec![sel(1)]);
        // New bytecode: no address is reusable anywhere.
        assert!(ops.iter().all(|op| op.facet_address.is_none()));
    }

    #[test]
    fn test_deployed_but_uncut_facet_is_replaced_on_resume() {
        // An earlier run redeployed AFacet (pool address updated) but died
        // before the cut, so routing still points at the old address.
        let current = vec![facet("AFacet", "f2", &[(1, "a()")])];
        let mut prior = record_with(&[("AFacet", "f2", &[1])]);
        prior.applied_address_by_name.insert(
            "AFacet".to_string(),
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
        );

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, CutAction::Replace);
        // The already-deployed pool address is reused, no redeploy needed.
        assert_eq!(
            ops[0].facet_address,
            Some(address!("70997970C51812dc3A010C7d01b50e0d17dc79C8"))
        );
    }

    #[test]
    fn test_vanished_facet_is_fully_removed() {
        let current = vec![facet("AFacet", "f1", &[(1, "a()")])];
        let prior = record_with(&[("AFacet", "f1", &[1]), ("GoneFacet", "f9", &[7, 8])]);

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].facet_name, "GoneFacet");
        assert_eq!(ops[0].action, CutAction::Remove);
        assert_eq!(ops[0].selectors, vec![sel(7), sel(8)]);
    }

    #[test]
    fn test_collision_is_fatal_before_any_ops() {
        let current = vec![
            facet("AFacet", "f1", &[(0xaabbccdd, "a()")]),
            facet("BFacet", "f2", &[(0xaabbccdd, "clash()")]),
        ];
        let err = diff(&current, None, &no_core(), false).unwrap_err();
        match err {
            GemcutError::SelectorCollision { first, second, .. } => {
                assert_eq!(first, "AFacet");
                assert_eq!(second, "BFacet");
            }
            other => panic!("expected SelectorCollision, got {other:?}"),
        }
    }

    #[test]
    fn test_core_facet_never_removed_or_replaced() {
        let core: BTreeSet<String> = BTreeSet::from(["OwnershipFacet".to_string()]);

        // Source change drops selector 2 and changes bytecode.
        let current = vec![facet("OwnershipFacet", "f2", &[(1, "owner()")])];
        let prior = record_with(&[("OwnershipFacet", "f1", &[1, 2])]);

        let ops = diff(&current, Some(&prior), &core, false).unwrap();
        assert!(ops.is_empty());

        // And a core facet that disappeared from the scan stays untouched.
        let prior = record_with(&[("OwnershipFacet", "f1", &[1, 2])]);
        let ops = diff(&[], Some(&prior), &core, false).unwrap();
        assert!(ops.is_empty());
    }

    #[test]
    fn test_force_core_overrides_protection() {
        let core: BTreeSet<String> = BTreeSet::from(["OwnershipFacet".to_string()]);
        let current = vec![facet("OwnershipFacet", "f2", &[(1, "owner()")])];
        let prior = record_with(&[("OwnershipFacet", "f1", &[1, 2])]);

        let ops = diff(&current, Some(&prior), &core, true).unwrap();
        assert_eq!(
            ops.iter().map(|op| op.action).collect::<Vec<_>>(),
            vec![CutAction::Remove, CutAction::Replace]
        );
    }

    #[test]
    fn test_core_facet_still_gets_adds() {
        let core: BTreeSet<String> = BTreeSet::from(["OwnershipFacet".to_string()]);
        let current = vec![facet("OwnershipFacet", "f1", &[(1, "owner()"), (2, "nominate()")])];
        let prior = record_with(&[("OwnershipFacet", "f1", &[1])]);

        let ops = diff(&current, Some(&prior), &core, false).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].action, CutAction::Add);
        assert_eq!(ops[0].selectors, vec![sel(2)]);
    }

    #[test]
    fn test_add_colliding_with_surviving_core_owner_is_fatal() {
        let core: BTreeSet<String> = BTreeSet::from(["OwnershipFacet".to_string()]);

        // OwnershipFacet is not matched by the scan but keeps its selectors;
        // a scanned facet claiming one of them would create two simultaneous
        // owners on chain.
        let current = vec![facet("AdminFacet", "f2", &[(1, "owner()")])];
        let prior = record_with(&[("OwnershipFacet", "f1", &[1])]);

        let err = diff(&current, Some(&prior), &core, false).unwrap_err();
        match err {
            GemcutError::SelectorCollision {
                first,
                second,
                signature,
                ..
            } => {
                assert_eq!(first, "OwnershipFacet");
                assert_eq!(second, "AdminFacet");
                assert_eq!(signature, "owner()");
            }
            other => panic!("expected SelectorCollision, got {other:?}"),
        }

        // Lifting the protection removes the prior owner first, which makes
        // the move legal.
        let ops = diff(&current, Some(&prior), &core, true).unwrap();
        assert_eq!(
            ops.iter().map(|op| op.action).collect::<Vec<_>>(),
            vec![CutAction::Remove, CutAction::Add]
        );
    }

    #[test]
    fn test_same_run_selector_move_is_remove_then_add() {
        // Selector 1 moves from AFacet to BFacet in one run.
        let current = vec![
            facet("AFacet", "f1", &[(2, "b()")]),
            facet("BFacet", "f2", &[(1, "a()")]),
        ];
        let prior = record_with(&[("AFacet", "f1", &[1, 2])]);

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!((ops[0].action, ops[0].facet_name.as_str()), (CutAction::Remove, "AFacet"));
        assert_eq!((ops[1].action, ops[1].facet_name.as_str()), (CutAction::Add, "BFacet"));
    }

    #[test]
    fn test_deterministic_ordering_across_actions() {
        let current = vec![
            facet("AFacet", "f1-new", &[(1, "a()"), (9, "z()")]),
            facet("BFacet", "f2", &[(4, "d()")]),
        ];
        let prior = record_with(&[
            ("AFacet", "f1", &[1, 2]),
            ("GoneFacet", "f9", &[7]),
        ]);

        let ops = diff(&current, Some(&prior), &no_core(), false).unwrap();
        let shape: Vec<(CutAction, &str)> = ops
            .iter()
            .map(|op| (op.action, op.facet_name.as_str()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (CutAction::Remove, "AFacet"),
                (CutAction::Remove, "GoneFacet"),
                (CutAction::Replace, "AFacet"),
                (CutAction::Add, "AFacet"),
                (CutAction::Add, "BFacet"),
            ]
        );
    }

    #[test]
    fn test_apply_operations_tracks_routing_state() {
        let prior = BTreeMap::from([("AFacet".to_string(), vec![sel(1), sel(2)])]);
        let ops = vec![
            DiamondCutOperation {
                facet_name: "AFacet".to_string(),
                facet_address: None,
                action: CutAction::Remove,
                selectors: vec![sel(1)],
            },
            DiamondCutOperation {
                facet_name: "BFacet".to_string(),
                facet_address: None,
                action: CutAction::Add,
                selectors: vec![sel(1), sel(3)],
            },
        ];

        let state = apply_operations(&prior, &ops);
        assert_eq!(state.get("AFacet").unwrap(), &vec![sel(2)]);
        assert_eq!(state.get("BFacet").unwrap(), &vec![sel(1), sel(3)]);
    }
}
