use std::{collections::BTreeSet, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use bitcoin::Txid;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    assembler::{Coin, Draft, SignedTx},
    bitcoin_client::{Error as RpcError, Ledger},
    retry::{new_backoff_limited, new_sync_backoff, notify, retry_transient},
};

use super::{
    error::ScenarioError,
    report::{Outcome, Report},
    step::ScenarioStep,
};

/// Reject reasons meaning the node already has the transaction.
const ALREADY_KNOWN: [&str; 2] = ["txn-already-in-mempool", "txn-already-known"];

/// Executes [`ScenarioStep`]s against a set of nodes and records the outcome
/// of each in a [`Report`].
pub struct Orchestrator<L: Ledger> {
    nodes: Vec<L>,
    cancel_token: CancellationToken,
    backoff: ExponentialBuilder,
    sync_backoff: ExponentialBuilder,
    report: Report,
}

impl<L: Ledger> Orchestrator<L> {
    pub fn new(
        scenario: impl Into<String>,
        nodes: Vec<L>,
        cancel_token: CancellationToken,
        rpc_retries: usize,
        sync_timeout: Duration,
    ) -> Self {
        Self::with_backoff(
            scenario,
            nodes,
            cancel_token,
            new_backoff_limited(rpc_retries),
        )
        .with_sync_backoff(new_sync_backoff(sync_timeout))
    }

    pub fn with_backoff(
        scenario: impl Into<String>,
        nodes: Vec<L>,
        cancel_token: CancellationToken,
        backoff: ExponentialBuilder,
    ) -> Self {
        Self {
            nodes,
            cancel_token,
            sync_backoff: backoff,
            backoff,
            report: Report::new(scenario),
        }
    }

    /// Policy for the [`ScenarioStep::SyncNodes`] barrier, which waits on
    /// relay rather than on a failing call.
    pub fn with_sync_backoff(mut self, sync_backoff: ExponentialBuilder) -> Self {
        self.sync_backoff = sync_backoff;
        self
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn report_mut(&mut self) -> &mut Report {
        &mut self.report
    }

    pub fn into_report(self) -> Report {
        self.report
    }

    fn node(&self, node: usize) -> Result<&L, ScenarioError> {
        self.nodes.get(node).ok_or(ScenarioError::UnknownNode {
            node,
            nodes: self.nodes.len(),
        })
    }

    async fn ledger_call<T, F, Fut>(&self, action: &str, operation: F) -> Result<T, ScenarioError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        retry_transient(operation, action, &self.backoff, self.cancel_token.clone())
            .await
            .map_err(|e| ScenarioError::infrastructure(action, e))
    }

    pub async fn list_unspent(&self, node: usize) -> Result<Vec<Coin>, ScenarioError> {
        let ledger = self.node(node)?;
        self.ledger_call("listunspent", || ledger.list_unspent())
            .await
    }

    pub async fn chain_height(&self, node: usize) -> Result<u64, ScenarioError> {
        let ledger = self.node(node)?;
        self.ledger_call("getblockcount", || ledger.get_chain_height())
            .await
    }

    pub async fn sign_with_wallet(
        &self,
        node: usize,
        draft: Draft,
    ) -> Result<SignedTx, ScenarioError> {
        let ledger = self.node(node)?;
        let tx = draft.into_unsigned();
        self.ledger_call("signrawtransactionwithwallet", || {
            ledger.sign_with_wallet(tx.clone())
        })
        .await
    }

    pub async fn sign_batch_with_wallet(
        &self,
        node: usize,
        drafts: Vec<Draft>,
    ) -> Result<Vec<SignedTx>, ScenarioError> {
        let ledger = self.node(node)?;
        let txs: Vec<_> = drafts.into_iter().map(Draft::into_unsigned).collect();
        self.ledger_call("signrawtransactionwithwallet", || {
            ledger.sign_batch_with_wallet(txs.clone())
        })
        .await
    }

    /// Runs `steps` in order, stopping at the first failure.
    pub async fn run(&mut self, steps: Vec<ScenarioStep>) -> Result<(), ScenarioError> {
        for step in steps {
            self.run_step(step).await?;
        }
        Ok(())
    }

    pub async fn run_step(&mut self, step: ScenarioStep) -> Result<(), ScenarioError> {
        let index = self.report.steps.len();
        let description = step.to_string();
        let result = if self.cancel_token.is_cancelled() {
            Err(ScenarioError::Cancelled)
        } else {
            self.execute(index, &step).await
        };
        match &result {
            Ok(()) => {
                info!(step = index, "{}", description);
                self.report.record(step.name(), description, Outcome::Passed);
            }
            Err(e) => {
                error!(step = index, "{} failed: {}", description, e);
                self.report
                    .record(step.name(), description, Outcome::Failed(e.to_string()));
            }
        }
        result
    }

    async fn execute(&self, index: usize, step: &ScenarioStep) -> Result<(), ScenarioError> {
        match step {
            ScenarioStep::Broadcast { tx, node } => self.broadcast(index, tx, *node).await,
            ScenarioStep::MineBlocks { count, node } => {
                let ledger = self.node(*node)?;
                // Not retried: a lost response would mine twice
                let height = ledger
                    .mine_blocks(*count)
                    .await
                    .map_err(|e| ScenarioError::infrastructure("generatetoaddress", e))?;
                info!(node = *node, height, "Mined {} blocks", count);
                Ok(())
            }
            ScenarioStep::AssertMempoolContains { txid, node } => {
                let mempool = self.mempool(*node).await?;
                if mempool.contains(txid) {
                    Ok(())
                } else {
                    Err(ScenarioError::AssertionFailed {
                        step: index,
                        detail: format!("{} missing from node {} mempool", txid, node),
                    })
                }
            }
            ScenarioStep::AssertAcceptance {
                tx,
                expected,
                expected_reason,
                node,
            } => {
                let ledger = self.node(*node)?;
                let verdict = self
                    .ledger_call("testmempoolaccept", || ledger.test_acceptance(tx))
                    .await?;
                let reason_matches = match (expected_reason, &verdict.reason) {
                    (None, _) => true,
                    (Some(expected), Some(actual)) => actual == expected,
                    (Some(_), None) => false,
                };
                if verdict.allowed == *expected && reason_matches {
                    Ok(())
                } else {
                    Err(ScenarioError::AssertionFailed {
                        step: index,
                        detail: format!(
                            "{} expected allowed={} reason={:?}, got allowed={} reason={:?}",
                            tx.txid(),
                            expected,
                            expected_reason,
                            verdict.allowed,
                            verdict.reason
                        ),
                    })
                }
            }
            ScenarioStep::SyncNodes => self.sync_nodes().await,
            ScenarioStep::AssertMempoolEmpty { node } => {
                let mempool = self.mempool(*node).await?;
                if mempool.is_empty() {
                    Ok(())
                } else {
                    Err(ScenarioError::AssertionFailed {
                        step: index,
                        detail: format!(
                            "node {} mempool holds {} transactions",
                            node,
                            mempool.len()
                        ),
                    })
                }
            }
        }
    }

    async fn broadcast(&self, index: usize, tx: &SignedTx, node: usize) -> Result<(), ScenarioError> {
        let ledger = self.node(node)?;
        let result = self
            .ledger_call("sendrawtransaction", || ledger.submit_transaction(tx, None))
            .await;
        match result {
            Ok(txid) if txid == tx.txid() => Ok(()),
            Ok(txid) => Err(ScenarioError::AssertionFailed {
                step: index,
                detail: format!("node returned txid {} for {}", txid, tx.txid()),
            }),
            Err(ScenarioError::Infrastructure { source, .. })
                if source
                    .rejection_reason()
                    .is_some_and(|r| ALREADY_KNOWN.iter().any(|k| r.starts_with(k))) =>
            {
                warn!(txid = %tx.txid(), "Already known to node {}", node);
                Ok(())
            }
            Err(ScenarioError::Infrastructure {
                source: RpcError::Rejected { reason, .. },
                ..
            }) => Err(ScenarioError::UnexpectedRejection {
                txid: tx.txid(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    async fn mempool(&self, node: usize) -> Result<BTreeSet<Txid>, ScenarioError> {
        let ledger = self.node(node)?;
        let ids = self
            .ledger_call("getrawmempool", || ledger.list_mempool_ids())
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn check_synced(&self) -> Result<(), ScenarioError> {
        let mut reference: Option<(u64, BTreeSet<Txid>)> = None;
        for (i, ledger) in self.nodes.iter().enumerate() {
            let height = ledger
                .get_chain_height()
                .await
                .map_err(|e| ScenarioError::infrastructure("getblockcount", e))?;
            let mempool: BTreeSet<Txid> = ledger
                .list_mempool_ids()
                .await
                .map_err(|e| ScenarioError::infrastructure("getrawmempool", e))?
                .into_iter()
                .collect();
            match &reference {
                None => reference = Some((height, mempool)),
                Some((h, _)) if *h != height => {
                    return Err(ScenarioError::Diverged(format!(
                        "node {} at height {}, node 0 at {}",
                        i, height, h
                    )));
                }
                Some((_, m)) if *m != mempool => {
                    return Err(ScenarioError::Diverged(format!(
                        "node {} mempool has {} transactions, node 0 has {}",
                        i,
                        mempool.len(),
                        m.len()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn sync_nodes(&self) -> Result<(), ScenarioError> {
        let cancel_token = self.cancel_token.clone();
        (|| self.check_synced())
            .retry(&self.sync_backoff)
            .notify(notify("sync nodes"))
            .when(move |e: &ScenarioError| {
                !cancel_token.is_cancelled()
                    && (matches!(e, ScenarioError::Diverged(_)) || e.is_transient())
            })
            .await
    }
}
