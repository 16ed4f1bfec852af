use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bitcoin::{
    Amount, FeeRate, OutPoint, Sequence, Transaction, Txid, Witness, hashes::Hash,
};
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    assembler::{Coin, SignedTx},
    bitcoin_client::{
        Error, Ledger,
        error::WARMUP_CODE,
        types::Verdict,
    },
    budget::{MAX_BLOCK_WEIGHT, MAX_STANDARD_TX_WEIGHT},
};

pub const COINBASE_MATURITY: u64 = 100;
pub const HALVING_INTERVAL: u64 = 150;
pub const MIN_RELAY_FEERATE: u64 = 1;

const REJECTED: i32 = -26;
const ALREADY_IN_MEMPOOL: i32 = -27;
const MISSING_INPUTS: i32 = -25;
const INSUFFICIENT_FEE: &str = "insufficient fee";

#[derive(Debug, Clone, Copy)]
struct Utxo {
    value: Amount,
    height: u64,
    coinbase: bool,
}

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: SignedTx,
    fee: Amount,
    vsize: u64,
}

impl MempoolEntry {
    fn feerate(&self) -> f64 {
        self.fee.to_sat() as f64 / self.vsize.max(1) as f64
    }

    fn signals(&self) -> bool {
        self.tx.tx().input.iter().any(|input| input.sequence.is_rbf())
    }
}

fn rejection(code: i32, reason: impl Into<String>) -> Error {
    Error::Rejected {
        code,
        reason: reason.into(),
    }
}

pub fn block_subsidy(height: u64) -> Amount {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return Amount::ZERO;
    }
    Amount::from_sat(Amount::from_int_btc(50).to_sat() >> halvings)
}

/// Chain and mempool shared by every node of a [`StubNetwork`], so its nodes
/// never diverge.
#[derive(Debug, Default)]
struct Chain {
    height: u64,
    utxos: HashMap<OutPoint, Utxo>,
    mempool: IndexMap<Txid, MempoolEntry>,
    blocks: Vec<Vec<Txid>>,
}

impl Chain {
    fn mempool_spends(&self) -> HashMap<OutPoint, Txid> {
        self.mempool
            .iter()
            .flat_map(|(txid, entry)| {
                entry
                    .tx
                    .tx()
                    .input
                    .iter()
                    .map(move |input| (input.previous_output, *txid))
            })
            .collect()
    }

    fn descendants(&self, roots: &HashSet<Txid>) -> HashSet<Txid> {
        let mut found = roots.clone();
        loop {
            let before = found.len();
            for (txid, entry) in &self.mempool {
                if entry
                    .tx
                    .tx()
                    .input
                    .iter()
                    .any(|input| found.contains(&input.previous_output.txid))
                {
                    found.insert(*txid);
                }
            }
            if found.len() == before {
                return found;
            }
        }
    }

    fn is_final(tx: &Transaction, height: u64) -> bool {
        let lock_time = tx.lock_time.to_consensus_u32() as u64;
        lock_time == 0
            || !tx.lock_time.is_block_height()
            || lock_time < height
            || tx.input.iter().all(|input| input.sequence == Sequence::MAX)
    }

    fn input_value(&self, tx: &Transaction) -> Result<Amount, Error> {
        let spend_height = self.height + 1;
        let mut total = Amount::ZERO;
        for input in &tx.input {
            let outpoint = input.previous_output;
            let value = if let Some(utxo) = self.utxos.get(&outpoint) {
                if utxo.coinbase && spend_height - utxo.height < COINBASE_MATURITY {
                    return Err(rejection(
                        REJECTED,
                        "bad-txns-premature-spend-of-coinbase",
                    ));
                }
                utxo.value
            } else {
                self.mempool
                    .get(&outpoint.txid)
                    .and_then(|parent| parent.tx.tx().output.get(outpoint.vout as usize))
                    .map(|output| output.value)
                    .ok_or_else(|| rejection(MISSING_INPUTS, "bad-txns-inputs-missingorspent"))?
            };
            total = total
                .checked_add(value)
                .ok_or_else(|| rejection(REJECTED, "bad-txns-inputvalues-outofrange"))?;
        }
        Ok(total)
    }

    /// Mirrors the admission checks of a node without full replace-by-fee,
    /// returning the entry and the transactions it evicts.
    fn check(
        &self,
        tx: &SignedTx,
        max_fee_rate: Option<FeeRate>,
    ) -> Result<(MempoolEntry, HashSet<Txid>), Error> {
        if self.mempool.contains_key(&tx.txid()) {
            return Err(rejection(ALREADY_IN_MEMPOOL, "txn-already-in-mempool"));
        }
        if tx.weight().to_wu() > MAX_STANDARD_TX_WEIGHT {
            return Err(rejection(REJECTED, "tx-size"));
        }
        if !Self::is_final(tx.tx(), self.height + 1) {
            return Err(rejection(REJECTED, "non-final"));
        }
        let input_value = self.input_value(tx.tx())?;
        let output_value = tx
            .tx()
            .output
            .iter()
            .try_fold(Amount::ZERO, |acc, output| acc.checked_add(output.value))
            .ok_or_else(|| rejection(REJECTED, "bad-txns-txouttotal-toolarge"))?;
        let fee = input_value
            .checked_sub(output_value)
            .ok_or_else(|| rejection(REJECTED, "bad-txns-in-belowout"))?;
        let entry = MempoolEntry {
            tx: tx.clone(),
            fee,
            vsize: tx.vsize(),
        };
        if fee.to_sat() < entry.vsize * MIN_RELAY_FEERATE {
            return Err(rejection(REJECTED, "min relay fee not met"));
        }
        let ceiling = max_fee_rate.map_or(0, |rate| rate.to_sat_per_kwu());
        if ceiling > 0 && fee.to_sat() * 250 > ceiling * entry.vsize {
            return Err(rejection(MISSING_INPUTS, "max-fee-exceeded"));
        }

        let spends = self.mempool_spends();
        let conflicts: HashSet<Txid> = tx
            .tx()
            .input
            .iter()
            .filter_map(|input| spends.get(&input.previous_output).copied())
            .collect();
        if conflicts.is_empty() {
            return Ok((entry, conflicts));
        }
        for txid in &conflicts {
            let conflict = &self.mempool[txid];
            // Only the conflicting transaction's own inputs count
            if !conflict.signals() {
                return Err(rejection(REJECTED, "txn-mempool-conflict"));
            }
            if entry.feerate() <= conflict.feerate() {
                debug!(txid = %tx.txid(), conflict = %txid, "Replacement fee rate too low");
                return Err(rejection(REJECTED, INSUFFICIENT_FEE));
            }
        }
        let evicted = self.descendants(&conflicts);
        let evicted_fees: Amount = evicted.iter().map(|txid| self.mempool[txid].fee).sum();
        if fee < evicted_fees {
            debug!(
                txid = %tx.txid(),
                "Less fees than conflicting txs; {} < {}",
                fee,
                evicted_fees
            );
            return Err(rejection(REJECTED, INSUFFICIENT_FEE));
        }
        if (fee - evicted_fees).to_sat() < entry.vsize * MIN_RELAY_FEERATE {
            debug!(txid = %tx.txid(), "Not enough additional fees to relay");
            return Err(rejection(REJECTED, INSUFFICIENT_FEE));
        }
        Ok((entry, evicted))
    }

    fn accept(&mut self, tx: &SignedTx, max_fee_rate: Option<FeeRate>) -> Result<Txid, Error> {
        let (entry, evicted) = self.check(tx, max_fee_rate)?;
        for txid in evicted {
            self.mempool.shift_remove(&txid);
        }
        let txid = tx.txid();
        self.mempool.insert(txid, entry);
        Ok(txid)
    }

    /// Picks mempool transactions by descending fee rate, parents first,
    /// until the next one does not fit.
    fn block_template(&self, height: u64) -> Vec<Txid> {
        let mut candidates: Vec<&MempoolEntry> = self.mempool.values().collect();
        candidates.sort_by(|a, b| b.feerate().total_cmp(&a.feerate()));
        let mut included: Vec<Txid> = vec![];
        let mut included_set: HashSet<Txid> = HashSet::new();
        let mut weight = 0u64;
        loop {
            let next = candidates.iter().position(|entry| {
                !included_set.contains(&entry.tx.txid())
                    && Self::is_final(entry.tx.tx(), height)
                    && entry.tx.tx().input.iter().all(|input| {
                        let parent = input.previous_output.txid;
                        !self.mempool.contains_key(&parent) || included_set.contains(&parent)
                    })
            });
            let Some(index) = next else {
                return included;
            };
            let entry = candidates.remove(index);
            let tx_weight = entry.tx.weight().to_wu();
            if weight + tx_weight > MAX_BLOCK_WEIGHT {
                return included;
            }
            weight += tx_weight;
            included.push(entry.tx.txid());
            included_set.insert(entry.tx.txid());
        }
    }

    fn mine_block(&mut self) {
        let height = self.height + 1;
        let template = self.block_template(height);
        let mut fees = Amount::ZERO;
        for txid in &template {
            let Some(entry) = self.mempool.shift_remove(txid) else {
                continue;
            };
            fees += entry.fee;
            for input in &entry.tx.tx().input {
                self.utxos.remove(&input.previous_output);
            }
            for (vout, output) in entry.tx.tx().output.iter().enumerate() {
                self.utxos.insert(
                    OutPoint {
                        txid: *txid,
                        vout: vout as u32,
                    },
                    Utxo {
                        value: output.value,
                        height,
                        coinbase: false,
                    },
                );
            }
        }
        let coinbase = Txid::hash(format!("coinbase-{}", height).as_bytes());
        self.utxos.insert(
            OutPoint {
                txid: coinbase,
                vout: 0,
            },
            Utxo {
                value: block_subsidy(height) + fees,
                height,
                coinbase: true,
            },
        );
        let mut block = vec![coinbase];
        block.extend(template);
        self.blocks.push(block);
        self.height = height;
    }

    /// Coinbase outputs at least 101 confirmations deep, one more than
    /// consensus needs, and not already spent by a mempool transaction.
    fn wallet_coins(&self) -> Vec<Coin> {
        let spends = self.mempool_spends();
        let mut coins: Vec<(u64, Coin)> = self
            .utxos
            .iter()
            .filter(|(outpoint, utxo)| {
                utxo.coinbase
                    && self.height - utxo.height >= COINBASE_MATURITY
                    && !spends.contains_key(outpoint)
            })
            .map(|(outpoint, utxo)| {
                (
                    utxo.height,
                    Coin {
                        outpoint: *outpoint,
                        value: utxo.value,
                    },
                )
            })
            .collect();
        coins.sort_by_key(|(height, coin)| (*height, coin.outpoint));
        coins.into_iter().map(|(_, coin)| coin).collect()
    }
}

/// In-memory stand-in for a set of regtest nodes that relay to each other.
#[derive(Debug, Clone, Default)]
pub struct StubNetwork {
    chain: Arc<Mutex<Chain>>,
}

impl StubNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, name: &str) -> StubNode {
        StubNode {
            name: name.to_string(),
            chain: self.chain.clone(),
            failures: Arc::new(AtomicUsize::new(0)),
            lagging: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn nodes(&self, count: usize) -> Vec<StubNode> {
        (0..count)
            .map(|i| self.node(&format!("node-{}", i)))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StubNode {
    name: String,
    chain: Arc<Mutex<Chain>>,
    failures: Arc<AtomicUsize>,
    lagging: Arc<AtomicUsize>,
}

impl StubNode {
    /// Makes the next `count` calls fail as if the node were warming up.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `polls` height queries report one block less, as a
    /// peer still waiting for the tip to be relayed would.
    pub fn lag(&self, polls: usize) {
        self.lagging.store(polls, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), Error> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(node = %self.name, "Injecting warmup failure");
            return Err(Error::BitcoinRpc {
                code: WARMUP_CODE,
                message: "Loading block index...".to_string(),
            });
        }
        Ok(())
    }

    pub async fn mempool_len(&self) -> usize {
        self.chain.lock().await.mempool.len()
    }

    /// Txids of the block at `height`, coinbase first.
    pub async fn block(&self, height: u64) -> Option<Vec<Txid>> {
        let chain = self.chain.lock().await;
        height
            .checked_sub(1)
            .and_then(|i| chain.blocks.get(i as usize))
            .cloned()
    }

    pub async fn is_confirmed(&self, txid: &Txid) -> bool {
        let chain = self.chain.lock().await;
        chain.blocks.iter().any(|block| block.contains(txid))
    }
}

impl Ledger for StubNode {
    async fn submit_transaction(
        &self,
        tx: &SignedTx,
        max_fee_rate: Option<FeeRate>,
    ) -> Result<Txid, Error> {
        self.take_failure()?;
        self.chain.lock().await.accept(tx, max_fee_rate)
    }

    async fn test_acceptance(&self, tx: &SignedTx) -> Result<Verdict, Error> {
        self.take_failure()?;
        let chain = self.chain.lock().await;
        Ok(match chain.check(tx, None) {
            Ok(_) => Verdict::accepted(),
            Err(Error::Rejected { reason, .. }) => Verdict::rejected(reason),
            Err(e) => return Err(e),
        })
    }

    async fn list_mempool_ids(&self) -> Result<Vec<Txid>, Error> {
        self.take_failure()?;
        Ok(self.chain.lock().await.mempool.keys().copied().collect())
    }

    async fn list_unspent(&self) -> Result<Vec<Coin>, Error> {
        self.take_failure()?;
        Ok(self.chain.lock().await.wallet_coins())
    }

    async fn mine_blocks(&self, count: u64) -> Result<u64, Error> {
        self.take_failure()?;
        let mut chain = self.chain.lock().await;
        for _ in 0..count {
            chain.mine_block();
        }
        debug!(node = %self.name, height = chain.height, "Mined {} blocks", count);
        Ok(chain.height)
    }

    async fn get_chain_height(&self) -> Result<u64, Error> {
        self.take_failure()?;
        let height = self.chain.lock().await.height;
        let behind = self
            .lagging
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(if behind {
            height.saturating_sub(1)
        } else {
            height
        })
    }

    async fn sign_with_wallet(&self, mut tx: Transaction) -> Result<SignedTx, Error> {
        self.take_failure()?;
        let chain = self.chain.lock().await;
        for input in tx.input.iter_mut() {
            match chain.utxos.get(&input.previous_output) {
                Some(utxo) if utxo.coinbase => {
                    input.witness = Witness::from_slice(&[vec![0x30; 72], vec![0x02; 33]]);
                }
                _ => {
                    return Err(Error::SigningFailed(format!(
                        "{} not owned by wallet",
                        input.previous_output
                    )));
                }
            }
        }
        Ok(SignedTx::from_ledger(tx))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{ScriptBuf, absolute::LockTime};

    use super::*;
    use crate::{
        assembler::{Fee, Intent, assemble},
        script::ContractScript,
        signer::{Branch, build_witness},
    };

    fn sink() -> ScriptBuf {
        ContractScript::trivial().script_pubkey()
    }

    async fn funded(node: &StubNode) -> Coin {
        node.mine_blocks(COINBASE_MATURITY + 1).await.unwrap();
        node.list_unspent().await.unwrap()[0]
    }

    async fn spend_wallet_coin(
        node: &StubNode,
        coin: Coin,
        fee: u64,
        sequence: Sequence,
    ) -> SignedTx {
        let draft = assemble(
            Intent::Spend,
            &[coin],
            Fee::absolute(Amount::from_sat(fee)),
            &sink(),
            LockTime::ZERO,
            sequence,
        )
        .unwrap();
        node.sign_with_wallet(draft.into_unsigned()).await.unwrap()
    }

    fn spend_trivial(parent: &SignedTx, fee: u64, sequence: Sequence) -> SignedTx {
        let trivial = ContractScript::trivial();
        let draft = assemble(
            Intent::Spend,
            &[parent.output(0).unwrap()],
            Fee::absolute(Amount::from_sat(fee)),
            &trivial.script_pubkey(),
            LockTime::ZERO,
            sequence,
        )
        .unwrap();
        draft
            .finalize(vec![build_witness(&Branch::Trivial, &[], &trivial).unwrap()])
            .unwrap()
    }

    #[test]
    fn test_subsidy_halves() {
        assert_eq!(block_subsidy(1), Amount::from_int_btc(50));
        assert_eq!(block_subsidy(150), Amount::from_int_btc(25));
        assert_eq!(block_subsidy(300), Amount::from_sat(1_250_000_000));
    }

    #[tokio::test]
    async fn test_coinbase_matures_after_100_blocks() {
        let network = StubNetwork::new();
        let node = network.node("a");
        node.mine_blocks(COINBASE_MATURITY).await.unwrap();
        assert!(node.list_unspent().await.unwrap().is_empty());
        node.mine_blocks(1).await.unwrap();
        let coins = node.list_unspent().await.unwrap();
        assert_eq!(coins.len(), 1);
        assert_eq!(coins[0].value, Amount::from_int_btc(50));
    }

    #[tokio::test]
    async fn test_nodes_share_mempool() {
        let network = StubNetwork::new();
        let (a, b) = (network.node("a"), network.node("b"));
        let coin = funded(&a).await;
        let tx = spend_wallet_coin(&a, coin, 1_000, Sequence::MAX).await;
        assert_eq!(a.submit_transaction(&tx, None).await.unwrap(), tx.txid());
        assert_eq!(b.list_mempool_ids().await.unwrap(), vec![tx.txid()]);
        assert!(b.list_unspent().await.unwrap().is_empty());

        let err = b.submit_transaction(&tx, None).await.unwrap_err();
        assert_eq!(err.rejection_reason(), Some("txn-already-in-mempool"));

        b.mine_blocks(1).await.unwrap();
        assert_eq!(a.mempool_len().await, 0);
        assert!(a.is_confirmed(&tx.txid()).await);
        assert_eq!(a.block(102).await.unwrap()[1], tx.txid());
    }

    #[tokio::test]
    async fn test_non_signaling_conflict_rejected() {
        let network = StubNetwork::new();
        let node = network.node("a");
        let coin = funded(&node).await;
        let parent = spend_wallet_coin(&node, coin, 1_000, Sequence(0xfffffffd)).await;
        node.submit_transaction(&parent, None).await.unwrap();
        let child = spend_trivial(&parent, 1_000, Sequence::MAX);
        node.submit_transaction(&child, None).await.unwrap();

        let replacement = spend_trivial(&parent, 100_000, Sequence::MAX);
        let verdict = node.test_acceptance(&replacement).await.unwrap();
        assert_eq!(verdict, Verdict::rejected("txn-mempool-conflict"));

        // The parent still signals on its own
        let replacement_parent = spend_wallet_coin(&node, coin, 100_000, Sequence::MAX).await;
        assert!(node.test_acceptance(&replacement_parent).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_replacement_pays_for_descendants() {
        let network = StubNetwork::new();
        let node = network.node("a");
        let coin = funded(&node).await;
        let parent = spend_wallet_coin(&node, coin, 1_000, Sequence::MAX).await;
        node.submit_transaction(&parent, None).await.unwrap();
        let claim = spend_trivial(&parent, 500, Sequence(1));
        node.submit_transaction(&claim, None).await.unwrap();
        let junk = spend_trivial(&claim, 5_000, Sequence(1));
        node.submit_transaction(&junk, None).await.unwrap();

        let bump = spend_trivial(&parent, 2_000, Sequence(1));
        let verdict = node.test_acceptance(&bump).await.unwrap();
        assert_eq!(verdict, Verdict::rejected("insufficient fee"));

        let big_bump = spend_trivial(&parent, 10_000, Sequence(1));
        node.submit_transaction(&big_bump, None).await.unwrap();
        assert_eq!(
            node.list_mempool_ids().await.unwrap(),
            vec![parent.txid(), big_bump.txid()]
        );
    }

    #[tokio::test]
    async fn test_timelocked_tx_waits_for_height() {
        let network = StubNetwork::new();
        let node = network.node("a");
        let coin = funded(&node).await;
        let height = node.get_chain_height().await.unwrap() as u32;
        let draft = assemble(
            Intent::Spend,
            &[coin],
            Fee::absolute(Amount::from_sat(1_000)),
            &sink(),
            LockTime::from_consensus(height + 2),
            Sequence(1),
        )
        .unwrap();
        let tx = node.sign_with_wallet(draft.into_unsigned()).await.unwrap();
        let err = node.submit_transaction(&tx, None).await.unwrap_err();
        assert_eq!(err.rejection_reason(), Some("non-final"));
        node.mine_blocks(2).await.unwrap();
        node.submit_transaction(&tx, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_wallet_refuses_foreign_inputs() {
        let network = StubNetwork::new();
        let node = network.node("a");
        let coin = funded(&node).await;
        let parent = spend_wallet_coin(&node, coin, 1_000, Sequence::MAX).await;
        let child = spend_trivial(&parent, 1_000, Sequence::MAX);
        let err = node
            .sign_with_wallet(child.tx().clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed(_)));
    }

    #[tokio::test]
    async fn test_batch_signing_keeps_order() {
        let network = StubNetwork::new();
        let node = network.node("a");
        node.mine_blocks(COINBASE_MATURITY + 2).await.unwrap();
        let coins = node.list_unspent().await.unwrap();
        let txs: Vec<Transaction> = coins
            .iter()
            .map(|coin| {
                assemble(
                    Intent::Spend,
                    &[*coin],
                    Fee::absolute(Amount::from_sat(1_000)),
                    &sink(),
                    LockTime::ZERO,
                    Sequence::MAX,
                )
                .unwrap()
                .into_unsigned()
            })
            .collect();
        let signed = node.sign_batch_with_wallet(txs.clone()).await.unwrap();
        assert_eq!(signed.len(), 2);
        for (tx, coin) in signed.iter().zip(&coins) {
            assert_eq!(tx.tx().input[0].previous_output, coin.outpoint);
            assert_eq!(tx.tx().input[0].witness.len(), 2);
        }

        let parent = SignedTx::from_ledger(txs[0].clone());
        let foreign = spend_trivial(&parent, 1_000, Sequence::MAX).tx().clone();
        let err = node
            .sign_batch_with_wallet(vec![txs[1].clone(), foreign])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SigningFailed(_)));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let network = StubNetwork::new();
        let node = network.node("a");
        node.fail_next(2);
        assert!(node.get_chain_height().await.unwrap_err().is_transient());
        assert!(node.get_chain_height().await.unwrap_err().is_transient());
        assert_eq!(node.get_chain_height().await.unwrap(), 0);
    }
}
