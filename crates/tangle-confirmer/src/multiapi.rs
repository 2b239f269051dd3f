//! One logical ledger call over a set of redundant endpoints.
//!
//! Reads race the identical request against every endpoint and take the first success.
//! Mutations (signing, proof-of-work, store/broadcast) go to the first endpoint only, since
//! their side effects are not idempotent across independent nodes.

use crate::config::EndpointConfig;
use crate::health::{EndpointHandle, EndpointHealth};
use crate::node::{Consistency, HttpNode, LedgerNode, NodeError, PrepareOptions, Tips, Transfer};
use crate::trytes::Hash;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(String),
    #[error("{endpoint}: {source}")]
    Call {
        endpoint: String,
        duration: Duration,
        #[source]
        source: NodeError,
    },
}

/// A successful call: the value and the one endpoint it is attributed to.
#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub value: T,
    pub endpoint: String,
    pub duration: Duration,
}

struct Endpoint {
    node: Arc<dyn LedgerNode>,
    timeout: Duration,
}

/// Immutable, ordered list of endpoints for one role (general, tip selection, proof-of-work).
pub struct EndpointSet {
    label: String,
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    /// Build [HttpNode]s for every configured endpoint.
    pub fn from_config(label: &str, configs: &[EndpointConfig]) -> Result<Self, ApiError> {
        let mut nodes: Vec<(Arc<dyn LedgerNode>, Duration)> = Vec::with_capacity(configs.len());
        for c in configs {
            if c.timeout_secs == 0 {
                return Err(ApiError::InvalidConfig(format!(
                    "{}: timeout must be positive",
                    c.url
                )));
            }
            let node = HttpNode::new(&c.url, c.timeout())
                .map_err(|e| ApiError::InvalidConfig(format!("{}: {e}", c.url)))?;
            nodes.push((Arc::new(node), c.timeout()));
        }
        Self::from_nodes(label, nodes)
    }

    pub fn from_nodes(
        label: &str,
        nodes: Vec<(Arc<dyn LedgerNode>, Duration)>,
    ) -> Result<Self, ApiError> {
        if nodes.is_empty() {
            return Err(ApiError::InvalidConfig(format!("{label}: no endpoints")));
        }
        let mut endpoints = Vec::with_capacity(nodes.len());
        for (node, timeout) in nodes {
            if timeout.is_zero() {
                return Err(ApiError::InvalidConfig(format!(
                    "{}: timeout must be positive",
                    node.endpoint()
                )));
            }
            endpoints.push(Endpoint { node, timeout });
        }
        Ok(Self {
            label: label.to_string(),
            endpoints,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|e| e.node.endpoint())
    }

    fn first(&self) -> &Endpoint {
        &self.endpoints[0]
    }
}

/// Ledger API over one [EndpointSet], reporting every outcome to [EndpointHealth].
pub struct MultiEndpointClient {
    set: EndpointSet,
    health: Arc<EndpointHealth>,
    /// Health registration per endpoint, in `set` order.
    handles: Vec<EndpointHandle>,
}

impl MultiEndpointClient {
    pub fn new(set: EndpointSet, health: Arc<EndpointHealth>) -> Self {
        let handles = set
            .endpoints()
            .map(|endpoint| health.register_endpoint(endpoint, set.label()))
            .collect();
        Self {
            set,
            health,
            handles,
        }
    }

    pub fn endpoint_set(&self) -> &EndpointSet {
        &self.set
    }

    /// Issue `call` against every endpoint; first success wins, otherwise the last error.
    ///
    /// Every spawned call runs to completion and reports its outcome even after a winner is
    /// returned; the result channel holds one slot per endpoint so late senders never block.
    async fn fan_out<T, F, Fut>(&self, op: &'static str, call: F) -> Result<Reply<T>, ApiError>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn LedgerNode>) -> Fut,
        Fut: Future<Output = Result<T, NodeError>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(self.set.len());
        for (ep, &handle) in self.set.endpoints.iter().zip(&self.handles) {
            let fut = call(Arc::clone(&ep.node));
            let tx = tx.clone();
            let health = Arc::clone(&self.health);
            let endpoint = ep.node.endpoint().to_string();
            let limit = ep.timeout;
            tokio::spawn(async move {
                let started = Instant::now();
                let res = match timeout(limit, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(NodeError::Timeout(limit)),
                };
                health.record_outcome(handle, res.as_ref().err());
                let _ = tx.send((endpoint, started.elapsed(), res)).await;
            });
        }
        drop(tx);

        let mut last_err = None;
        while let Some((endpoint, duration, res)) = rx.recv().await {
            match res {
                Ok(value) => {
                    return Ok(Reply {
                        value,
                        endpoint,
                        duration,
                    })
                }
                Err(source) => {
                    tracing::debug!(op, endpoint = %endpoint, reason = %source, "endpoint failed");
                    last_err = Some(ApiError::Call {
                        endpoint,
                        duration,
                        source,
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ApiError::InvalidConfig(format!("{}: no endpoint answered", self.set.label()))
        }))
    }

    /// Route a mutating call to the first endpoint only.
    async fn call_first<T, F, Fut>(&self, op: &'static str, call: F) -> Result<Reply<T>, ApiError>
    where
        F: FnOnce(Arc<dyn LedgerNode>) -> Fut,
        Fut: Future<Output = Result<T, NodeError>>,
    {
        let ep = self.set.first();
        let endpoint = ep.node.endpoint().to_string();
        let started = Instant::now();
        let res = match timeout(ep.timeout, call(Arc::clone(&ep.node))).await {
            Ok(r) => r,
            Err(_) => Err(NodeError::Timeout(ep.timeout)),
        };
        let duration = started.elapsed();
        self.health.record_outcome(self.handles[0], res.as_ref().err());
        match res {
            Ok(value) => Ok(Reply {
                value,
                endpoint,
                duration,
            }),
            Err(source) => {
                tracing::debug!(op, endpoint = %endpoint, reason = %source, "endpoint failed");
                Err(ApiError::Call {
                    endpoint,
                    duration,
                    source,
                })
            }
        }
    }

    pub async fn select_tips(&self, depth: u32) -> Result<Reply<Tips>, ApiError> {
        self.fan_out("getTransactionsToApprove", move |node| async move {
            node.select_tips(depth).await
        })
        .await
    }

    pub async fn check_consistency(&self, tails: &[Hash]) -> Result<Reply<Consistency>, ApiError> {
        let tails: Arc<[Hash]> = Arc::from(tails);
        self.fan_out("checkConsistency", move |node| {
            let tails = Arc::clone(&tails);
            async move { node.check_consistency(&tails).await }
        })
        .await
    }

    pub async fn get_inclusion_states(&self, hashes: &[Hash]) -> Result<Reply<Vec<bool>>, ApiError> {
        let hashes: Arc<[Hash]> = Arc::from(hashes);
        self.fan_out("getInclusionStates", move |node| {
            let hashes = Arc::clone(&hashes);
            async move { node.get_inclusion_states(&hashes).await }
        })
        .await
    }

    pub async fn find_transactions(&self, bundles: &[Hash]) -> Result<Reply<Vec<Hash>>, ApiError> {
        let bundles: Arc<[Hash]> = Arc::from(bundles);
        self.fan_out("findTransactions", move |node| {
            let bundles = Arc::clone(&bundles);
            async move { node.find_transactions(&bundles).await }
        })
        .await
    }

    pub async fn get_balances(
        &self,
        addresses: &[Hash],
        threshold: u8,
    ) -> Result<Reply<Vec<u64>>, ApiError> {
        let addresses: Arc<[Hash]> = Arc::from(addresses);
        self.fan_out("getBalances", move |node| {
            let addresses = Arc::clone(&addresses);
            async move { node.get_balances(&addresses, threshold).await }
        })
        .await
    }

    /// True if any transaction of `bundle` is included.
    pub async fn is_bundle_confirmed(&self, bundle: &Hash) -> Result<Reply<bool>, ApiError> {
        let found = self.find_transactions(std::slice::from_ref(bundle)).await?;
        if found.value.is_empty() {
            return Ok(Reply {
                value: false,
                endpoint: found.endpoint,
                duration: found.duration,
            });
        }
        let states = self.get_inclusion_states(&found.value).await?;
        Ok(Reply {
            value: states.value.iter().any(|s| *s),
            endpoint: states.endpoint,
            duration: found.duration + states.duration,
        })
    }

    pub async fn prepare_transfers(
        &self,
        seed: &str,
        transfers: &[Transfer],
        options: &PrepareOptions,
    ) -> Result<Reply<Vec<String>>, ApiError> {
        self.call_first("prepareTransfers", |node| async move {
            node.prepare_transfers(seed, transfers, options).await
        })
        .await
    }

    pub async fn attach_to_tangle(
        &self,
        trunk: &Hash,
        branch: &Hash,
        min_weight_magnitude: u32,
        trytes: &[String],
    ) -> Result<Reply<Vec<String>>, ApiError> {
        self.call_first("attachToTangle", |node| async move {
            node.attach_to_tangle(trunk, branch, min_weight_magnitude, trytes)
                .await
        })
        .await
    }

    pub async fn store_and_broadcast(&self, trytes: &[String]) -> Result<Reply<()>, ApiError> {
        self.call_first("storeAndBroadcast", |node| async move {
            node.store_and_broadcast(trytes).await
        })
        .await
    }
}

/// The three endpoint roles the confirmation engine talks to.
#[derive(Clone)]
pub struct LedgerApis {
    /// Consistency, inclusion, signing, store and broadcast.
    pub general: Arc<MultiEndpointClient>,
    pub tipsel: Arc<MultiEndpointClient>,
    /// Proof-of-work attachment.
    pub pow: Arc<MultiEndpointClient>,
}

impl LedgerApis {
    /// Use one client for every role.
    pub fn uniform(client: Arc<MultiEndpointClient>) -> Self {
        Self {
            general: Arc::clone(&client),
            tipsel: Arc::clone(&client),
            pow: client,
        }
    }
}
