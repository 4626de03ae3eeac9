//! Chain interaction.
//!
//! The orchestrator talks to the network through the [`ChainClient`] trait so
//! that tests can substitute a mock. The JSON-RPC implementation sends
//! transactions from a node-managed account and polls for receipts.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, address, b256, keccak256};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Default timeout for individual RPC requests.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between receipt polling attempts.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum time to wait for a transaction to be mined.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);

/// The canonical CREATE3 factory, deployed at the same address on all
/// supported networks. Exposes `deploy(bytes32 salt, bytes creationCode)`.
pub const DEFAULT_CREATE3_FACTORY: Address =
    address!("9fBB3DF7C40Da2e5A0dE984fFE2CCB7C47cd0ABf");

/// keccak256 of the CREATE3 proxy child initcode
/// (`0x67363d3d37363d34f03d5260086018f3`).
const CREATE3_PROXY_INITCODE_HASH: B256 =
    b256!("21c35dbe1b344a2488cf3321d6ce542f8e9f305544ff09e4993a62319a497c1f");

/// Compute the CREATE3 deployment address for `(deployer, salt)` through
/// `factory`.
///
/// Pure function of its inputs: no transaction and no RPC round-trip, so a
/// dry run can verify the address before anything is deployed. The salt is
/// guarded with the deployer address, which is what makes the scheme
/// per-deployer deterministic.
pub fn create3_address(factory: Address, deployer: Address, salt: B256) -> Address {
    let mut guarded_preimage = [0u8; 52];
    guarded_preimage[..20].copy_from_slice(deployer.as_slice());
    guarded_preimage[20..].copy_from_slice(salt.as_slice());
    let guarded_salt = keccak256(guarded_preimage);

    let proxy = factory.create2(guarded_salt, CREATE3_PROXY_INITCODE_HASH);
    // The proxy deploys the final contract with its first CREATE (nonce 1).
    proxy.create(1)
}

/// Minimal chain operations the orchestrator needs.
///
/// Every method waits for confirmation before returning; an `Err` is treated
/// as transient by the caller and retried with bounded backoff.
pub trait ChainClient: Send + Sync {
    /// Deploy creation bytecode from `from`; resolves to the confirmed
    /// contract address.
    fn deploy_contract(
        &self,
        from: Address,
        bytecode: Vec<u8>,
    ) -> impl Future<Output = Result<Address>> + Send;

    /// Send a calldata-carrying transaction; resolves to the confirmed
    /// transaction hash.
    fn send_transaction(
        &self,
        from: Address,
        to: Address,
        calldata: Vec<u8>,
    ) -> impl Future<Output = Result<B256>> + Send;

    /// Deployed code at `address` (empty if none).
    fn get_code(&self, address: Address) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// JSON-RPC [`ChainClient`] backed by a node-managed signer account.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .with_context(|| format!("Failed to send {method} request"))?;

        let result: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {method} response"))?;

        if let Some(error) = result.get("error") {
            anyhow::bail!(
                "RPC error from {method}: {}",
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
            );
        }

        let result_value = result
            .get("result")
            .context("No result in response")?
            .clone();
        serde_json::from_value(result_value)
            .with_context(|| format!("Failed to deserialize {method} result"))
    }

    /// Poll for the receipt of `tx_hash` until it is mined or the timeout
    /// elapses. Fails when the transaction reverted.
    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Value> {
        let deadline = std::time::Instant::now() + RECEIPT_TIMEOUT;
        loop {
            let receipt: Option<Value> = self
                .call(
                    "eth_getTransactionReceipt",
                    vec![serde_json::json!(tx_hash)],
                )
                .await?;

            if let Some(receipt) = receipt {
                let status = receipt
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("0x0");
                if status != "0x1" {
                    anyhow::bail!("transaction {tx_hash} reverted");
                }
                return Ok(receipt);
            }

            if std::time::Instant::now() > deadline {
                anyhow::bail!(
                    "timed out waiting for transaction {tx_hash} to be mined"
                );
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn submit(&self, tx: Value) -> Result<(B256, Value)> {
        let tx_hash: B256 = self.call("eth_sendTransaction", vec![tx]).await?;
        tracing::debug!(tx_hash = %tx_hash, "Transaction submitted");
        let receipt = self.wait_for_receipt(tx_hash).await?;
        Ok((tx_hash, receipt))
    }
}

impl ChainClient for JsonRpcClient {
    async fn deploy_contract(&self, from: Address, bytecode: Vec<u8>) -> Result<Address> {
        let (_, receipt) = self
            .submit(serde_json::json!({
                "from": from,
                "data": format!("0x{}", hex::encode(&bytecode)),
            }))
            .await?;
        let address = receipt
            .get("contractAddress")
            .and_then(Value::as_str)
            .context("deployment receipt has no contract address")?
            .parse::<Address>()
            .context("deployment receipt has an invalid contract address")?;
        Ok(address)
    }

    async fn send_transaction(
        &self,
        from: Address,
        to: Address,
        calldata: Vec<u8>,
    ) -> Result<B256> {
        let (tx_hash, _) = self
            .submit(serde_json::json!({
                "from": from,
                "to": to,
                "data": format!("0x{}", hex::encode(&calldata)),
            }))
            .await?;
        Ok(tx_hash)
    }

    async fn get_code(&self, address: Address) -> Result<Vec<u8>> {
        let code: String = self
            .call(
                "eth_getCode",
                vec![serde_json::json!(address), serde_json::json!("latest")],
            )
            .await?;
        hex::decode(code.trim_start_matches("0x")).context("invalid code hex")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create3_address_is_deterministic() {
        let deployer = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        let salt = b256!("f8aac9c60a8577e3e439a5639f65f9eca367e2c6de7086f4b4076c0a895d1902");

        let first = create3_address(DEFAULT_CREATE3_FACTORY, deployer, salt);
        let second = create3_address(DEFAULT_CREATE3_FACTORY, deployer, salt);
        assert_eq!(first, second);
    }

    #[test]
    fn test_create3_address_changes_with_salt() {
        let deployer = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        let salt_a = b256!("f8aac9c60a8577e3e439a5639f65f9eca367e2c6de7086f4b4076c0a895d1902");
        let salt_b = b256!("f8aac9c60a8577e3e439a5639f65f9eca367e2c6de7086f4b4076c0a895d1903");

        assert_ne!(
            create3_address(DEFAULT_CREATE3_FACTORY, deployer, salt_a),
            create3_address(DEFAULT_CREATE3_FACTORY, deployer, salt_b)
        );
    }

    #[test]
    fn test_create3_address_changes_with_deployer() {
        let salt = b256!("f8aac9c60a8577e3e439a5639f65f9eca367e2c6de7086f4b4076c0a895d1902");
        let deployer_a = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        let deployer_b = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

        assert_ne!(
            create3_address(DEFAULT_CREATE3_FACTORY, deployer_a, salt),
            create3_address(DEFAULT_CREATE3_FACTORY, deployer_b, salt)
        );
    }
}
