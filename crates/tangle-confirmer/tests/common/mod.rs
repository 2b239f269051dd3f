//! Common helpers for integration tests: an in-memory ledger node and bundle builders.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tangle_confirmer::{
    tail_of, Consistency, EndpointHealth, EndpointSet, Hash, LedgerNode, MultiEndpointClient,
    NodeError, PrepareOptions, Tips, Transaction, Transfer,
};

pub fn hash_of(c: char) -> Hash {
    Hash::new(c.to_string().repeat(81)).expect("hash")
}

fn transaction(bundle: &Hash, index: i64, last: i64, tag: &str) -> Transaction {
    Transaction {
        hash: Hash::null(),
        signature_message_fragment: String::new(),
        address: hash_of('A'),
        value: 0,
        obsolete_tag: String::new(),
        timestamp: 1_700_000_000,
        current_index: index,
        last_index: last,
        bundle: bundle.clone(),
        trunk: Hash::null(),
        branch: Hash::null(),
        tag: tag.to_string(),
        attachment_timestamp: 0,
        attachment_timestamp_lower: 0,
        attachment_timestamp_upper: 0,
        nonce: String::new(),
    }
}

/// Bundle trytes with `len` transactions, last index first (the order nodes return them in).
pub fn bundle_trytes(bundle: &Hash, len: i64) -> Vec<String> {
    (0..len)
        .rev()
        .map(|i| transaction(bundle, i, len - 1, "BUNDLE").to_trytes().expect("encode"))
        .collect()
}

/// One recorded attachToTangle call.
#[derive(Debug, Clone)]
pub struct AttachCall {
    pub trunk: Hash,
    pub branch: Hash,
    pub min_weight_magnitude: u32,
    /// Bundle hash of the submitted trytes.
    pub bundle: Hash,
    /// Tail hash of the returned trytes.
    pub tail: Hash,
}

#[derive(Default)]
pub struct FakeState {
    pub fail_all: bool,
    pub fail_ops: HashSet<&'static str>,
    pub delay: Duration,
    pub consistent: bool,
    pub consistency_info: String,
    pub confirmed: HashSet<Hash>,
    pub corrupt_bundle: bool,
    pub attach_calls: Vec<AttachCall>,
    pub consistency_checks: usize,
    pub inclusion_polls: usize,
    pub broadcasts: usize,
    pub prepares: usize,
    pub calls: usize,
}

/// In-memory node. Tip selection always answers trunk `T..`/branch `R..`.
pub struct FakeNode {
    name: String,
    pub state: Mutex<FakeState>,
}

impl FakeNode {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(FakeState {
                consistent: true,
                ..Default::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().expect("fake state"))
    }

    pub fn confirm(&self, bundle: &Hash) {
        self.with(|s| s.confirmed.insert(bundle.clone()));
    }

    pub fn attach_calls(&self) -> Vec<AttachCall> {
        self.with(|s| s.attach_calls.clone())
    }

    async fn enter(&self, op: &'static str) -> Result<(), NodeError> {
        let delay = self.with(|s| {
            s.calls += 1;
            s.delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            if s.fail_all || s.fail_ops.contains(op) {
                Err(NodeError::Node(format!("{} refused {op}", self.name)))
            } else {
                Ok(())
            }
        })
    }
}

fn decode(e: impl std::fmt::Display) -> NodeError {
    NodeError::Decode(e.to_string())
}

#[async_trait]
impl LedgerNode for FakeNode {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn select_tips(&self, _depth: u32) -> Result<Tips, NodeError> {
        self.enter("select_tips").await?;
        Ok(Tips {
            trunk: hash_of('T'),
            branch: hash_of('R'),
        })
    }

    async fn check_consistency(&self, _tails: &[Hash]) -> Result<Consistency, NodeError> {
        self.enter("check_consistency").await?;
        Ok(self.with(|s| {
            s.consistency_checks += 1;
            Consistency {
                consistent: s.consistent,
                info: s.consistency_info.clone(),
            }
        }))
    }

    async fn get_inclusion_states(&self, hashes: &[Hash]) -> Result<Vec<bool>, NodeError> {
        self.enter("get_inclusion_states").await?;
        Ok(self.with(|s| {
            s.inclusion_polls += 1;
            hashes.iter().map(|h| s.confirmed.contains(h)).collect()
        }))
    }

    /// Answers with the bundle hashes themselves standing in for transaction hashes.
    async fn find_transactions(&self, bundles: &[Hash]) -> Result<Vec<Hash>, NodeError> {
        self.enter("find_transactions").await?;
        Ok(bundles.to_vec())
    }

    async fn prepare_transfers(
        &self,
        _seed: &str,
        transfers: &[Transfer],
        _options: &PrepareOptions,
    ) -> Result<Vec<String>, NodeError> {
        self.enter("prepare_transfers").await?;
        let n = self.with(|s| {
            s.prepares += 1;
            s.prepares
        });
        let tag = transfers.first().map(|t| t.tag.clone()).unwrap_or_default();
        let mut tx = transaction(&hash_of('P'), 0, 0, &tag);
        tx.timestamp += n as i64;
        Ok(vec![tx.to_trytes().map_err(decode)?])
    }

    async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        min_weight_magnitude: u32,
        trytes: &[String],
    ) -> Result<Vec<String>, NodeError> {
        self.enter("attach_to_tangle").await?;
        let mut st = self.state.lock().expect("fake state");
        let stamp = st.attach_calls.len() as i64 + 1;
        let mut input_bundle = None;
        let mut out = Vec::with_capacity(trytes.len());
        for t in trytes {
            let mut tx = Transaction::from_trytes(t).map_err(decode)?;
            input_bundle.get_or_insert_with(|| tx.bundle.clone());
            tx.trunk = trunk.clone();
            tx.branch = branch.clone();
            tx.attachment_timestamp = stamp;
            if st.corrupt_bundle {
                tx.bundle = hash_of('C');
            }
            out.push(tx.to_trytes().map_err(decode)?);
        }
        let tail = tail_of(&out).map_err(decode)?.hash;
        st.attach_calls.push(AttachCall {
            trunk: trunk.clone(),
            branch: branch.clone(),
            min_weight_magnitude,
            bundle: input_bundle.unwrap_or_else(Hash::null),
            tail,
        });
        Ok(out)
    }

    async fn store_and_broadcast(&self, _trytes: &[String]) -> Result<(), NodeError> {
        self.enter("store_and_broadcast").await?;
        self.with(|s| s.broadcasts += 1);
        Ok(())
    }

    async fn get_balances(&self, addresses: &[Hash], _threshold: u8) -> Result<Vec<u64>, NodeError> {
        self.enter("get_balances").await?;
        Ok(vec![0; addresses.len()])
    }
}

pub fn client_with_timeout(
    label: &str,
    nodes: &[Arc<FakeNode>],
    health: &Arc<EndpointHealth>,
    timeout: Duration,
) -> Arc<MultiEndpointClient> {
    let nodes = nodes
        .iter()
        .map(|n| (Arc::clone(n) as Arc<dyn LedgerNode>, timeout))
        .collect();
    let set = EndpointSet::from_nodes(label, nodes).expect("endpoint set");
    Arc::new(MultiEndpointClient::new(set, Arc::clone(health)))
}

pub fn client(nodes: &[Arc<FakeNode>], health: &Arc<EndpointHealth>) -> Arc<MultiEndpointClient> {
    client_with_timeout("general", nodes, health, Duration::from_secs(30))
}
