//! Ledger node call contracts and an HTTP implementation.
//!
//! [LedgerNode] is the only thing the rest of the crate knows about a node. [HttpNode] speaks the
//! node's JSON command API (`{"command": ..}` POST bodies); anything else that implements the
//! trait (a test double, another transport) plugs into [crate::multiapi] the same way.

use crate::trytes::Hash;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("node error: {0}")]
    Node(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Tip selection result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tips {
    pub trunk: Hash,
    pub branch: Hash,
}

/// checkConsistency result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consistency {
    pub consistent: bool,
    pub info: String,
}

impl Consistency {
    /// A tail that is merely not solid yet is still promotable.
    pub fn is_promotable(&self) -> bool {
        self.consistent || self.info.to_lowercase().contains("not solid")
    }
}

/// One output of a transfer to be prepared (and signed, if it moves value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub address: Hash,
    pub value: u64,
    pub tag: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrepareOptions {
    pub security: u8,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self { security: 2 }
    }
}

/// The ledger operations consumed by the confirmation core.
#[async_trait]
pub trait LedgerNode: Send + Sync {
    /// Identifier used for logging and health accounting (the URL for [HttpNode]).
    fn endpoint(&self) -> &str;

    async fn select_tips(&self, depth: u32) -> Result<Tips, NodeError>;

    async fn check_consistency(&self, tails: &[Hash]) -> Result<Consistency, NodeError>;

    async fn get_inclusion_states(&self, hashes: &[Hash]) -> Result<Vec<bool>, NodeError>;

    /// Hashes of every transaction carrying one of `bundles`.
    async fn find_transactions(&self, bundles: &[Hash]) -> Result<Vec<Hash>, NodeError>;

    async fn prepare_transfers(
        &self,
        seed: &str,
        transfers: &[Transfer],
        options: &PrepareOptions,
    ) -> Result<Vec<String>, NodeError>;

    async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        min_weight_magnitude: u32,
        trytes: &[String],
    ) -> Result<Vec<String>, NodeError>;

    async fn store_and_broadcast(&self, trytes: &[String]) -> Result<(), NodeError>;

    async fn get_balances(&self, addresses: &[Hash], threshold: u8) -> Result<Vec<u64>, NodeError>;
}

/// JSON command client for one node.
pub struct HttpNode {
    url: String,
    client: reqwest::Client,
}

impl HttpNode {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn command(&self, body: Value) -> Result<Value, NodeError> {
        let resp = self
            .client
            .post(&self.url)
            .header("X-IOTA-API-Version", "1")
            .json(&body)
            .send()
            .await?;
        let json: Value = resp.json().await?;
        for key in ["error", "exception"] {
            if let Some(err) = json.get(key) {
                let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
                return Err(NodeError::Node(msg));
            }
        }
        Ok(json)
    }
}

fn field<'a>(v: &'a Value, key: &str) -> Result<&'a Value, NodeError> {
    v.get(key)
        .ok_or_else(|| NodeError::Decode(format!("missing {key}")))
}

fn hash_field(v: &Value, key: &str) -> Result<Hash, NodeError> {
    let s = field(v, key)?
        .as_str()
        .ok_or_else(|| NodeError::Decode(format!("{key} not string")))?;
    Hash::new(s).map_err(|e| NodeError::Decode(format!("{key}: {e}")))
}

fn string_array(v: &Value, key: &str) -> Result<Vec<String>, NodeError> {
    field(v, key)?
        .as_array()
        .ok_or_else(|| NodeError::Decode(format!("{key} not array")))?
        .iter()
        .map(|s| {
            s.as_str()
                .map(str::to_string)
                .ok_or_else(|| NodeError::Decode(format!("{key} element not string")))
        })
        .collect()
}

fn hash_strings(hashes: &[Hash]) -> Vec<&str> {
    hashes.iter().map(Hash::as_str).collect()
}

#[async_trait]
impl LedgerNode for HttpNode {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn select_tips(&self, depth: u32) -> Result<Tips, NodeError> {
        let v = self
            .command(json!({"command": "getTransactionsToApprove", "depth": depth}))
            .await?;
        Ok(Tips {
            trunk: hash_field(&v, "trunkTransaction")?,
            branch: hash_field(&v, "branchTransaction")?,
        })
    }

    async fn check_consistency(&self, tails: &[Hash]) -> Result<Consistency, NodeError> {
        let v = self
            .command(json!({"command": "checkConsistency", "tails": hash_strings(tails)}))
            .await?;
        let consistent = field(&v, "state")?
            .as_bool()
            .ok_or_else(|| NodeError::Decode("state not bool".into()))?;
        let info = v
            .get("info")
            .and_then(|i| i.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(Consistency { consistent, info })
    }

    async fn get_inclusion_states(&self, hashes: &[Hash]) -> Result<Vec<bool>, NodeError> {
        let v = self
            .command(json!({
                "command": "getInclusionStates",
                "transactions": hash_strings(hashes),
            }))
            .await?;
        field(&v, "states")?
            .as_array()
            .ok_or_else(|| NodeError::Decode("states not array".into()))?
            .iter()
            .map(|s| {
                s.as_bool()
                    .ok_or_else(|| NodeError::Decode("state not bool".into()))
            })
            .collect()
    }

    async fn find_transactions(&self, bundles: &[Hash]) -> Result<Vec<Hash>, NodeError> {
        let v = self
            .command(json!({"command": "findTransactions", "bundles": hash_strings(bundles)}))
            .await?;
        string_array(&v, "hashes")?
            .into_iter()
            .map(|h| Hash::new(h).map_err(|e| NodeError::Decode(e.to_string())))
            .collect()
    }

    async fn prepare_transfers(
        &self,
        seed: &str,
        transfers: &[Transfer],
        options: &PrepareOptions,
    ) -> Result<Vec<String>, NodeError> {
        let v = self
            .command(json!({
                "command": "prepareTransfers",
                "seed": seed,
                "transfers": transfers,
                "security": options.security,
            }))
            .await?;
        string_array(&v, "trytes")
    }

    async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        min_weight_magnitude: u32,
        trytes: &[String],
    ) -> Result<Vec<String>, NodeError> {
        let v = self
            .command(json!({
                "command": "attachToTangle",
                "trunkTransaction": trunk.as_str(),
                "branchTransaction": branch.as_str(),
                "minWeightMagnitude": min_weight_magnitude,
                "trytes": trytes,
            }))
            .await?;
        string_array(&v, "trytes")
    }

    async fn store_and_broadcast(&self, trytes: &[String]) -> Result<(), NodeError> {
        self.command(json!({"command": "storeTransactions", "trytes": trytes}))
            .await?;
        self.command(json!({"command": "broadcastTransactions", "trytes": trytes}))
            .await?;
        Ok(())
    }

    async fn get_balances(&self, addresses: &[Hash], threshold: u8) -> Result<Vec<u64>, NodeError> {
        let v = self
            .command(json!({
                "command": "getBalances",
                "addresses": hash_strings(addresses),
                "threshold": threshold,
            }))
            .await?;
        string_array(&v, "balances")?
            .into_iter()
            .map(|b| b.parse::<u64>().map_err(|e| NodeError::Decode(e.to_string())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_solid_counts_as_promotable() {
        let c = Consistency {
            consistent: false,
            info: "tails are not solid (missing a referenced tx): ABC".into(),
        };
        assert!(c.is_promotable());
        let c = Consistency {
            consistent: false,
            info: "entry point is inconsistent".into(),
        };
        assert!(!c.is_promotable());
        let c = Consistency {
            consistent: true,
            info: String::new(),
        };
        assert!(c.is_promotable());
    }

    #[test]
    fn decodes_tip_reply() {
        let a = "A".repeat(81);
        let b = "B".repeat(81);
        let v = json!({"trunkTransaction": a, "branchTransaction": b, "duration": 3});
        assert_eq!(hash_field(&v, "trunkTransaction").unwrap().as_str(), a);
        assert!(matches!(hash_field(&v, "missing"), Err(NodeError::Decode(_))));
    }

    #[test]
    fn string_array_rejects_non_strings() {
        let v = json!({"trytes": ["ABC", 5]});
        assert!(string_array(&v, "trytes").is_err());
        let v = json!({"trytes": ["ABC", "DEF"]});
        assert_eq!(string_array(&v, "trytes").unwrap(), vec!["ABC", "DEF"]);
    }

    #[test]
    fn transfer_serializes_for_signing_endpoint() {
        let t = Transfer {
            address: Hash::null(),
            value: 0,
            tag: "PROMOTE".into(),
            message: String::new(),
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["value"], 0);
        assert_eq!(v["address"].as_str().unwrap().len(), 81);
    }
}
