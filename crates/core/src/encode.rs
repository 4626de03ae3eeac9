//! Minimal ABI encoding for the handful of calls gemcut submits.
//!
//! Covers exactly what the orchestrator needs: the `diamondCut` call (an
//! array of tuples with a nested dynamic `bytes4[]`), the CREATE3 factory
//! `deploy(bytes32,bytes)` call, and statically encodable initializer
//! arguments.

use alloy_core::primitives::{Address, B256, keccak256};

use crate::config::InitArg;
use crate::diff::DiamondCutOperation;
use crate::error::GemcutError;
use crate::scanner::Selector;

/// First 4 bytes of the keccak-256 hash of a canonical signature.
pub fn selector_of(signature: &str) -> Selector {
    Selector::from_slice(&keccak256(signature.as_bytes())[..4])
}

fn word_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

fn word_address(address: Address) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address.as_slice());
    word
}

/// Right-pad `data` to a multiple of 32 bytes.
fn padded(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % 32;
    if rem != 0 {
        out.resize(out.len() + 32 - rem, 0);
    }
    out
}

/// Encode a dynamic `bytes` value (length word + padded content).
fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = word_u64(data.len() as u64).to_vec();
    out.extend(padded(data));
    out
}

/// Encode one `(address facet, uint8 action, bytes4[] selectors)` tuple.
fn encode_cut_tuple(address: Address, action: u8, selectors: &[Selector]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(word_address(address));
    out.extend(word_u64(action as u64));
    // Offset to the selector array, relative to the tuple start: 3 head words.
    out.extend(word_u64(96));
    out.extend(word_u64(selectors.len() as u64));
    for selector in selectors {
        // bytes4 is left-aligned in its word.
        let mut word = [0u8; 32];
        word[..4].copy_from_slice(selector.as_slice());
        out.extend(word);
    }
    out
}

/// Encode the full `diamondCut((address,uint8,bytes4[])[],address,bytes)`
/// calldata.
///
/// Every operation must carry a resolved facet address except Removes, which
/// route to the zero address.
pub fn encode_diamond_cut(
    ops: &[DiamondCutOperation],
    init: Option<(Address, &[u8])>,
) -> Result<Vec<u8>, GemcutError> {
    let mut tuples = Vec::with_capacity(ops.len());
    for op in ops {
        let address = match op.facet_address {
            Some(address) => address,
            None if op.action == crate::diff::CutAction::Remove => Address::ZERO,
            None => {
                return Err(GemcutError::Transaction {
                    stage: "ApplyCut".to_string(),
                    reason: format!(
                        "facet `{}` has no resolved address for {} operation",
                        op.facet_name, op.action
                    ),
                });
            }
        };
        tuples.push(encode_cut_tuple(address, op.action.chain_value(), &op.selectors));
    }

    // Array of dynamic tuples: length word, then per-element offsets
    // relative to the start of the element area, then the elements.
    let mut array = word_u64(tuples.len() as u64).to_vec();
    let mut offset = 32 * tuples.len();
    for tuple in &tuples {
        array.extend(word_u64(offset as u64));
        offset += tuple.len();
    }
    for tuple in &tuples {
        array.extend(tuple);
    }

    let (init_address, init_calldata) = match init {
        Some((address, calldata)) => (address, calldata),
        None => (Address::ZERO, &[] as &[u8]),
    };
    let init_bytes = encode_bytes(init_calldata);

    // Head: offset to cuts array, init address, offset to init bytes.
    let mut out = selector_of("diamondCut((address,uint8,bytes4[])[],address,bytes)").to_vec();
    out.extend(word_u64(96));
    out.extend(word_address(init_address));
    out.extend(word_u64(96 + array.len() as u64));
    out.extend(&array);
    out.extend(&init_bytes);
    Ok(out)
}

/// ABI-encode a single constructor `address` argument, appended verbatim to
/// creation bytecode.
pub fn encode_constructor_address(address: Address) -> [u8; 32] {
    word_address(address)
}

/// Encode the CREATE3 factory `deploy(bytes32 salt, bytes creationCode)` call.
pub fn encode_create3_deploy(salt: B256, creation_code: &[u8]) -> Vec<u8> {
    let mut out = selector_of("deploy(bytes32,bytes)").to_vec();
    out.extend(salt.as_slice());
    // Offset to the creation code bytes: 2 head words.
    out.extend(word_u64(64));
    out.extend(encode_bytes(creation_code));
    out
}

/// Encode the one-time initializer call from its canonical signature and the
/// target's declared arguments.
///
/// Only statically encoded parameter types are supported; the initializer's
/// arity and types come from its build artifact, so a mismatch against the
/// configured `init_args` is a configuration error.
pub fn encode_init_call(
    signature: &str,
    args: &[InitArg],
    target_name: &str,
) -> Result<Vec<u8>, GemcutError> {
    let params = signature
        .split_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))
        .ok_or_else(|| GemcutError::Config {
            field: format!("targets.{target_name}.init_args"),
            reason: format!("malformed initializer signature `{signature}`"),
        })?;
    let param_types: Vec<&str> = if params.is_empty() {
        Vec::new()
    } else {
        params.split(',').collect()
    };

    if param_types.len() != args.len() {
        return Err(GemcutError::Config {
            field: format!("targets.{target_name}.init_args"),
            reason: format!(
                "initializer `{signature}` takes {} argument(s), {} configured",
                param_types.len(),
                args.len()
            ),
        });
    }

    let mut out = selector_of(signature).to_vec();
    for (param_type, arg) in param_types.iter().zip(args) {
        out.extend(encode_static_arg(param_type, arg, target_name)?);
    }
    Ok(out)
}

fn encode_static_arg(
    param_type: &str,
    arg: &InitArg,
    target_name: &str,
) -> Result<[u8; 32], GemcutError> {
    let mismatch = |got: &str| GemcutError::Config {
        field: format!("targets.{target_name}.init_args"),
        reason: format!("cannot encode {got} as `{param_type}`"),
    };

    match (param_type, arg) {
        ("address", InitArg::Str(s)) => {
            let address: Address = s.parse().map_err(|_| mismatch(&format!("`{s}`")))?;
            Ok(word_address(address))
        }
        ("bytes32", InitArg::Str(s)) => {
            let word: B256 = s.parse().map_err(|_| mismatch(&format!("`{s}`")))?;
            Ok(word.0)
        }
        ("bool", InitArg::Str(s)) if s == "true" || s == "false" => {
            Ok(word_u64((s == "true") as u64))
        }
        (t, InitArg::Uint(v)) if t.starts_with("uint") => Ok(word_u64(*v)),
        (t, InitArg::Str(s)) if t.starts_with("uint") => {
            let value: u64 = s.parse().map_err(|_| mismatch(&format!("`{s}`")))?;
            Ok(word_u64(value))
        }
        (_, InitArg::Uint(v)) => Err(mismatch(&v.to_string())),
        (_, InitArg::Str(s)) => Err(mismatch(&format!("`{s}`"))),
    }
}
