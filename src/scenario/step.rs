use std::fmt;

use bitcoin::Txid;
use serde::{Deserialize, Serialize};

use crate::assembler::SignedTx;

/// One ledger interaction or check. Steps run strictly in order and the
/// first failing step aborts the scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioStep {
    Broadcast {
        tx: SignedTx,
        node: usize,
    },
    MineBlocks {
        count: u64,
        node: usize,
    },
    AssertMempoolContains {
        txid: Txid,
        node: usize,
    },
    /// Dry-run admission of `tx`; a `Some` reason must prefix the node's
    /// reject reason.
    AssertAcceptance {
        tx: SignedTx,
        expected: bool,
        expected_reason: Option<String>,
        node: usize,
    },
    /// Waits until every node agrees on height and mempool contents.
    SyncNodes,
    AssertMempoolEmpty {
        node: usize,
    },
}

impl ScenarioStep {
    pub fn broadcast(tx: &SignedTx, node: usize) -> Self {
        ScenarioStep::Broadcast {
            tx: tx.clone(),
            node,
        }
    }

    pub fn contains(tx: &SignedTx, node: usize) -> Self {
        ScenarioStep::AssertMempoolContains {
            txid: tx.txid(),
            node,
        }
    }

    pub fn accepted(tx: &SignedTx, node: usize) -> Self {
        ScenarioStep::AssertAcceptance {
            tx: tx.clone(),
            expected: true,
            expected_reason: None,
            node,
        }
    }

    pub fn rejected(tx: &SignedTx, reason: &str, node: usize) -> Self {
        ScenarioStep::AssertAcceptance {
            tx: tx.clone(),
            expected: false,
            expected_reason: Some(reason.to_string()),
            node,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioStep::Broadcast { .. } => "broadcast",
            ScenarioStep::MineBlocks { .. } => "mine_blocks",
            ScenarioStep::AssertMempoolContains { .. } => "assert_mempool_contains",
            ScenarioStep::AssertAcceptance { .. } => "assert_acceptance",
            ScenarioStep::SyncNodes => "sync_nodes",
            ScenarioStep::AssertMempoolEmpty { .. } => "assert_mempool_empty",
        }
    }

    pub fn node(&self) -> Option<usize> {
        match self {
            ScenarioStep::Broadcast { node, .. }
            | ScenarioStep::MineBlocks { node, .. }
            | ScenarioStep::AssertMempoolContains { node, .. }
            | ScenarioStep::AssertAcceptance { node, .. }
            | ScenarioStep::AssertMempoolEmpty { node } => Some(*node),
            ScenarioStep::SyncNodes => None,
        }
    }
}

impl fmt::Display for ScenarioStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStep::Broadcast { tx, node } => write!(f, "broadcast {} via node {}", tx.txid(), node),
            ScenarioStep::MineBlocks { count, node } => write!(f, "mine {} blocks on node {}", count, node),
            ScenarioStep::AssertMempoolContains { txid, node } => {
                write!(f, "node {} mempool contains {}", node, txid)
            }
            ScenarioStep::AssertAcceptance {
                tx,
                expected,
                expected_reason,
                node,
            } => match expected_reason {
                Some(reason) => write!(
                    f,
                    "node {} {} {} ({})",
                    node,
                    if *expected { "accepts" } else { "rejects" },
                    tx.txid(),
                    reason
                ),
                None => write!(
                    f,
                    "node {} {} {}",
                    node,
                    if *expected { "accepts" } else { "rejects" },
                    tx.txid()
                ),
            },
            ScenarioStep::SyncNodes => write!(f, "sync nodes"),
            ScenarioStep::AssertMempoolEmpty { node } => write!(f, "node {} mempool is empty", node),
        }
    }
}
