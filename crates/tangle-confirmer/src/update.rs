//! Events emitted by a confirmation task.

use futures_util::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    NoAction,
    Reattach,
    Promote,
    Confirm,
}

/// One task event; counters are cumulative over the task's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmerUpdate {
    pub num_attaches: u64,
    pub num_promotions: u64,
    /// Total proof-of-work (attachToTangle) time.
    pub total_duration_att_ms: u64,
    /// Total tip selection (getTransactionsToApprove) time.
    pub total_duration_gtta_ms: u64,
    /// Unix milliseconds.
    pub update_time: u64,
    pub kind: UpdateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConfirmerUpdate {
    pub fn is_terminal(&self) -> bool {
        self.kind == UpdateKind::Confirm
    }
}

/// Receiving side of a task's updates.
///
/// The channel has a single slot: the engine waits for the consumer (up to the configured
/// send timeout) before it can report the next event. Keep reading until `None`.
pub struct UpdateStream {
    rx: mpsc::Receiver<ConfirmerUpdate>,
}

impl UpdateStream {
    pub(crate) fn new(rx: mpsc::Receiver<ConfirmerUpdate>) -> Self {
        Self { rx }
    }

    /// Next update; `None` once the task has fully torn down.
    pub async fn recv(&mut self) -> Option<ConfirmerUpdate> {
        self.rx.recv().await
    }
}

impl Stream for UpdateStream {
    type Item = ConfirmerUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_serializes_kind_in_caps() {
        let u = ConfirmerUpdate {
            num_attaches: 1,
            num_promotions: 2,
            total_duration_att_ms: 30,
            total_duration_gtta_ms: 4,
            update_time: 1,
            kind: UpdateKind::NoAction,
            error: Some("node down".into()),
        };
        let v = serde_json::to_value(&u).unwrap();
        assert_eq!(v["kind"], "NO_ACTION");
        assert_eq!(v["error"], "node down");
        let v = serde_json::to_value(ConfirmerUpdate { error: None, ..u }).unwrap();
        assert!(v.get("error").is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_sender_dropped() {
        use futures_util::StreamExt;
        let (tx, rx) = mpsc::channel(1);
        let mut stream = UpdateStream::new(rx);
        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
