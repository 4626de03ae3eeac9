//! Foundry build artifact loading.
//!
//! The build command compiles facets into `<artifacts>/<File>.sol/<Contract>.json`
//! artifacts. Gemcut treats these as opaque inputs: it reads the
//! `methodIdentifiers` map (canonical signature to 4-byte selector), the ABI
//! (to render full function declarations) and the creation bytecode (to
//! deploy facets and fingerprint their code).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use alloy_core::primitives::keccak256;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::GemcutError;
use crate::scanner::Selector;

/// The parts of a compiled contract artifact consumed by gemcut.
#[derive(Debug, Clone)]
pub struct ContractArtifact {
    /// Canonical signature (`name(type,...)`) per selector, sorted by selector.
    pub signature_by_selector: BTreeMap<Selector, String>,
    /// Rendered Solidity declaration per selector, suitable for an interface.
    pub declaration_by_selector: BTreeMap<Selector, String>,
    /// Creation bytecode.
    pub bytecode: Vec<u8>,
    /// SHA-256 of the creation bytecode, hex encoded.
    pub code_fingerprint: String,
}

impl ContractArtifact {
    /// Load the artifact for `contract` compiled from `source_file_name`
    /// (e.g. `ERC20Facet.sol`).
    pub fn load(
        artifacts_dir: &Path,
        source_file_name: &str,
        contract: &str,
    ) -> Result<Self, GemcutError> {
        let path = artifacts_dir
            .join(source_file_name)
            .join(format!("{contract}.json"));
        let raw = std::fs::read_to_string(&path).map_err(|e| GemcutError::Scan {
            path: path.clone(),
            reason: format!("failed to read artifact (was the build command run?): {e}"),
        })?;
        let json: Value = serde_json::from_str(&raw).map_err(|e| GemcutError::Scan {
            path: path.clone(),
            reason: format!("artifact is not valid JSON: {e}"),
        })?;

        Self::parse(&json, &path)
    }

    fn parse(json: &Value, path: &PathBuf) -> Result<Self, GemcutError> {
        let scan_err = |reason: String| GemcutError::Scan {
            path: path.clone(),
            reason,
        };

        let identifiers = json
            .get("methodIdentifiers")
            .and_then(Value::as_object)
            .ok_or_else(|| scan_err("artifact has no `methodIdentifiers` map".to_string()))?;

        let mut signature_by_selector = BTreeMap::new();
        for (signature, selector_hex) in identifiers {
            let selector_hex = selector_hex
                .as_str()
                .ok_or_else(|| scan_err(format!("selector for `{signature}` is not a string")))?;
            let bytes = hex::decode(selector_hex).map_err(|e| {
                scan_err(format!("invalid selector hex for `{signature}`: {e}"))
            })?;
            if bytes.len() != 4 {
                return Err(scan_err(format!(
                    "selector for `{signature}` is {} bytes, expected 4",
                    bytes.len()
                )));
            }
            let selector = Selector::from_slice(&bytes);

            // The artifact's selector must match the signature hash; a
            // mismatch means the artifact and source are out of sync.
            let computed = Selector::from_slice(&keccak256(signature.as_bytes())[..4]);
            if computed != selector {
                return Err(scan_err(format!(
                    "selector {selector} does not match keccak256(`{signature}`)[..4] = {computed}"
                )));
            }

            signature_by_selector.insert(selector, signature.clone());
        }

        let abi = json
            .get("abi")
            .and_then(Value::as_array)
            .ok_or_else(|| scan_err("artifact has no `abi` array".to_string()))?;
        let declaration_by_selector = render_declarations(abi, &signature_by_selector);

        let bytecode_hex = json
            .get("bytecode")
            .and_then(|b| b.get("object"))
            .and_then(Value::as_str)
            .ok_or_else(|| scan_err("artifact has no `bytecode.object`".to_string()))?;
        let bytecode = hex::decode(bytecode_hex.trim_start_matches("0x"))
            .map_err(|e| scan_err(format!("invalid bytecode hex: {e}")))?;

        let code_fingerprint = hex::encode(Sha256::digest(&bytecode));

        Ok(Self {
            signature_by_selector,
            declaration_by_selector,
            bytecode,
            code_fingerprint,
        })
    }

    /// Selector and canonical signature of a named function, if present.
    ///
    /// Overloads are ambiguous; the initializer contract must declare exactly
    /// one function with the configured name.
    pub fn function_by_name(&self, name: &str) -> Option<(Selector, &str)> {
        let prefix = format!("{name}(");
        let mut matches = self
            .signature_by_selector
            .iter()
            .filter(|(_, sig)| sig.starts_with(&prefix));
        let found = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some((*found.0, found.1.as_str()))
    }
}

/// Render full Solidity declarations from ABI entries, keyed by selector.
fn render_declarations(
    abi: &[Value],
    signature_by_selector: &BTreeMap<Selector, String>,
) -> BTreeMap<Selector, String> {
    let mut out = BTreeMap::new();
    for entry in abi {
        if entry.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        let inputs = entry
            .get("inputs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Match this ABI entry to its selector via the canonical signature.
        let canonical = format!(
            "{name}({})",
            inputs.iter().map(canonical_type).collect::<Vec<_>>().join(",")
        );
        let Some((selector, _)) = signature_by_selector
            .iter()
            .find(|(_, sig)| **sig == canonical)
        else {
            continue;
        };

        let params = inputs
            .iter()
            .map(|p| render_param(p, true))
            .collect::<Vec<_>>()
            .join(", ");

        let mutability = match entry.get("stateMutability").and_then(Value::as_str) {
            Some("view") => " view",
            Some("pure") => " pure",
            Some("payable") => " payable",
            _ => "",
        };

        let outputs = entry
            .get("outputs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let returns = if outputs.is_empty() {
            String::new()
        } else {
            format!(
                " returns ({})",
                outputs
                    .iter()
                    .map(|p| render_param(p, false))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        out.insert(
            *selector,
            format!("function {name}({params}) external{mutability}{returns};"),
        );
    }
    out
}

/// The canonical ABI type of a parameter, used for signature matching.
fn canonical_type(param: &Value) -> String {
    param
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Render one parameter for a Solidity declaration.
///
/// Struct and enum parameters use their `internalType` name (the generated
/// interface imports the defining files), and reference types get an explicit
/// data location as required in external function headers.
fn render_param(param: &Value, named: bool) -> String {
    let abi_type = param.get("type").and_then(Value::as_str).unwrap_or_default();
    let internal = param.get("internalType").and_then(Value::as_str);

    let rendered_type = match internal {
        Some(i) if i != abi_type => i
            .trim_start_matches("struct ")
            .trim_start_matches("enum ")
            .trim_start_matches("contract ")
            .to_string(),
        _ => abi_type.to_string(),
    };

    let needs_location = abi_type == "string"
        || abi_type == "bytes"
        || abi_type.ends_with(']')
        || abi_type.starts_with("tuple");
    let location = if needs_location { " memory" } else { "" };

    let name = param.get("name").and_then(Value::as_str).unwrap_or_default();
    if named && !name.is_empty() {
        format!("{rendered_type}{location} {name}")
    } else {
        format!("{rendered_type}{location}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_artifact() -> Value {
        serde_json::json!({
            "abi": [
                {
                    "type": "function",
                    "name": "transfer",
                    "inputs": [
                        {"name": "to", "type": "address", "internalType": "address"},
                        {"name": "amount", "type": "uint256", "internalType": "uint256"}
                    ],
                    "outputs": [
                        {"name": "", "type": "bool", "internalType": "bool"}
                    ],
                    "stateMutability": "nonpayable"
                },
                {
                    "type": "function",
                    "name": "balanceOf",
                    "inputs": [
                        {"name": "owner", "type": "address", "internalType": "address"}
                    ],
                    "outputs": [
                        {"name": "", "type": "uint256", "internalType": "uint256"}
                    ],
                    "stateMutability": "view"
                },
                {"type": "event", "name": "Transfer", "inputs": []}
            ],
            "bytecode": {"object": "0x6080604052"},
            "methodIdentifiers": {
                "transfer(address,uint256)": "a9059cbb",
                "balanceOf(address)": "70a08231"
            }
        })
    }

    #[test]
    fn test_parse_extracts_selectors_and_bytecode() {
        let json = sample_artifact();
        let artifact =
            ContractArtifact::parse(&json, &PathBuf::from("out/Test.sol/Test.json")).unwrap();

        assert_eq!(artifact.signature_by_selector.len(), 2);
        let transfer = Selector::from([0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(
            artifact.signature_by_selector.get(&transfer).unwrap(),
            "transfer(address,uint256)"
        );
        assert_eq!(artifact.bytecode, vec![0x60, 0x80, 0x60, 0x40, 0x52]);
        assert_eq!(artifact.code_fingerprint.len(), 64);
    }

    #[test]
    fn test_parse_renders_declarations() {
        let json = sample_artifact();
        let artifact =
            ContractArtifact::parse(&json, &PathBuf::from("out/Test.sol/Test.json")).unwrap();

        let balance_of = Selector::from([0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(
            artifact.declaration_by_selector.get(&balance_of).unwrap(),
            "function balanceOf(address owner) external view returns (uint256);"
        );
    }

    #[test]
    fn test_selector_signature_mismatch_rejected() {
        let mut json = sample_artifact();
        json["methodIdentifiers"]["transfer(address,uint256)"] =
            Value::String("deadbeef".to_string());

        let err =
            ContractArtifact::parse(&json, &PathBuf::from("out/Test.sol/Test.json")).unwrap_err();
        assert!(matches!(err, GemcutError::Scan { .. }));
    }

    #[test]
    fn test_fingerprint_tracks_bytecode() {
        let json_a = sample_artifact();
        let mut json_b = sample_artifact();
        json_b["bytecode"]["object"] = Value::String("0x6080604053".to_string());

        let a = ContractArtifact::parse(&json_a, &PathBuf::from("a.json")).unwrap();
        let b = ContractArtifact::parse(&json_b, &PathBuf::from("b.json")).unwrap();
        assert_ne!(a.code_fingerprint, b.code_fingerprint);
    }

    #[test]
    fn test_function_by_name_rejects_overloads() {
        let json = serde_json::json!({
            "abi": [],
            "bytecode": {"object": "0x"},
            "methodIdentifiers": {
                "safeTransferFrom(address,address,uint256)": "42842e0e",
                "safeTransferFrom(address,address,uint256,bytes)": "b88d4fde",
                "init(address)": "19ab453c"
            }
        });
        let artifact = ContractArtifact::parse(&json, &PathBuf::from("i.json")).unwrap();
        assert!(artifact.function_by_name("safeTransferFrom").is_none());
        assert!(artifact.function_by_name("missing").is_none());
        assert!(artifact.function_by_name("init").is_some());
    }
}
