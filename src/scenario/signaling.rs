use bitcoin::{Amount, Sequence, absolute::LockTime};

use crate::{
    assembler::{Fee, Intent, SignedTx, assemble},
    bitcoin_client::Ledger,
    error::ConstructionError,
    script::ContractScript,
    signer::{Branch, build_witness},
};

use super::{
    error::ScenarioError, orchestrator::Orchestrator, pinning::COINBASE_MATURITY, step::ScenarioStep,
};

/// BIP125 explicit opt-in.
pub const OPT_IN_SEQUENCE: Sequence = Sequence(0xfffffffd);

const PARENT_VALUE: Amount = Amount::from_sat(999_998_000);
const REPLACEMENT_PARENT_VALUE: Amount = Amount::from_sat(990_000_000);
const CHILD_FEE: Amount = Amount::from_sat(8_000);
const REPLACEMENT_CHILD_FEE: Amount = Amount::from_sat(99_998_000);

/// A non-signalling child of a signalling parent cannot be replaced, even
/// though the parent itself can.
pub struct InheritedSignalingScenario<L: Ledger> {
    orchestrator: Orchestrator<L>,
}

impl<L: Ledger> InheritedSignalingScenario<L> {
    pub fn new(orchestrator: Orchestrator<L>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator<L> {
        &self.orchestrator
    }

    pub fn into_orchestrator(self) -> Orchestrator<L> {
        self.orchestrator
    }

    fn child(parent: &SignedTx, fee: Amount) -> Result<SignedTx, ScenarioError> {
        let trivial = ContractScript::trivial();
        let coin = parent
            .output(0)
            .ok_or(ConstructionError::NoInputs)?;
        let draft = assemble(
            Intent::Spend,
            &[coin],
            Fee::absolute(fee),
            &trivial.script_pubkey(),
            LockTime::ZERO,
            Sequence::MAX,
        )?;
        let witness = build_witness(&Branch::Trivial, &[], &trivial)?;
        Ok(draft.finalize(vec![witness])?)
    }

    pub async fn run(&mut self) -> Result<(), ScenarioError> {
        let mut coins = self.orchestrator.list_unspent(0).await?;
        if coins.is_empty() {
            self.orchestrator
                .run(vec![
                    ScenarioStep::MineBlocks {
                        count: COINBASE_MATURITY + 1,
                        node: 0,
                    },
                    ScenarioStep::SyncNodes,
                ])
                .await?;
            coins = self.orchestrator.list_unspent(0).await?;
        }
        let coin = coins
            .into_iter()
            .max_by_key(|coin| coin.value)
            .ok_or(ConstructionError::CoinsExhausted {
                needed: 1,
                available: 0,
            })?;
        let sink = ContractScript::trivial().script_pubkey();
        let spend_coin = |capacity| {
            assemble(
                Intent::Fund { capacity },
                &[coin],
                Fee::absolute(Amount::ZERO),
                &sink,
                LockTime::ZERO,
                OPT_IN_SEQUENCE,
            )
        };

        let parent = self
            .orchestrator
            .sign_with_wallet(0, spend_coin(PARENT_VALUE)?)
            .await?;
        let replacement_parent = self
            .orchestrator
            .sign_with_wallet(0, spend_coin(REPLACEMENT_PARENT_VALUE)?)
            .await?;
        let child = Self::child(&parent, CHILD_FEE)?;
        let replacement_child = Self::child(&parent, REPLACEMENT_CHILD_FEE)?;
        let last = self.orchestrator.node_count().saturating_sub(1);

        self.orchestrator
            .run(vec![
                ScenarioStep::broadcast(&parent, 0),
                ScenarioStep::contains(&parent, 0),
                ScenarioStep::SyncNodes,
                ScenarioStep::accepted(&replacement_parent, last),
                ScenarioStep::broadcast(&child, 0),
                ScenarioStep::contains(&child, 0),
                ScenarioStep::contains(&parent, 0),
                ScenarioStep::rejected(&replacement_child, "txn-mempool-conflict", 0),
                ScenarioStep::MineBlocks { count: 1, node: 0 },
                ScenarioStep::SyncNodes,
                ScenarioStep::AssertMempoolEmpty { node: 0 },
            ])
            .await?;
        self.orchestrator
            .report_mut()
            .note("Child replacement refused although its parent signals replaceability");
        Ok(())
    }
}
