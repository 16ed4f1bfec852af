use bitcoin::{
    Amount, Sequence,
    hashes::{Hash, hash160},
    secp256k1::{All, Secp256k1},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    assembler::{Coin, SignedTx},
    bitcoin_client::Ledger,
    budget::{BlockFill, batch_for_block_weight},
    channel::{ChannelState, ChannelUpdate, FUNDING_CAPACITY, Party, funding_draft, junk_child},
    error::ConstructionError,
    script::ContractScript,
};

use super::{error::ScenarioError, orchestrator::Orchestrator, step::ScenarioStep};

pub const PREIMAGE: [u8; 32] = [b'a'; 32];
/// Blocks mined when the wallet is short of mature coins, on top of the
/// coinbase maturity depth.
pub const BOOTSTRAP_BLOCKS: u64 = 501;
pub const COINBASE_MATURITY: u64 = 100;

const ALICE: usize = 0;
const UPDATE_FEE_RATE: u64 = 2;
const BUMPED_FEE_RATE: u64 = 10;
const FLOOD_BATCHES: usize = 10;
const FLOOD_STARTING_FEERATE: u64 = 5;
const FLOOD_FEERATE_STEP: u64 = 2;
const BC_TIMELOCK_DELTA: u32 = 10;
const AB_TIMELOCK_DELTA: u32 = 20;
const JUNK_CHILD_FEERATE: u64 = 2;
const JUNK_CHILD_ABSOLUTE_FEE: Amount = Amount::from_sat(2000);

/// How Carol keeps her preimage claim from being replaced by Bob's timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PinningVariant {
    /// Claim signals replaceability; a junk child makes any replacement pay
    /// more absolute fee than Bob's timeout offers.
    AbsoluteFee,
    /// Claim does not signal; its parent does, but the signal is not
    /// inherited (CVE-2021-31876).
    NoOptIn,
}

impl PinningVariant {
    pub fn name(&self) -> &'static str {
        match self {
            PinningVariant::AbsoluteFee => "absolute-fee",
            PinningVariant::NoOptIn => "no-opt-in",
        }
    }

    /// Sequence of the timeout and preimage inputs of each channel update.
    pub fn update_sequence(&self) -> Sequence {
        match self {
            PinningVariant::AbsoluteFee => Sequence(0x1),
            PinningVariant::NoOptIn => Sequence::MAX,
        }
    }

    fn expected_rejection(&self) -> &'static str {
        match self {
            PinningVariant::AbsoluteFee => "insufficient fee",
            PinningVariant::NoOptIn => "txn-mempool-conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PinningState {
    Init,
    ChannelsFunded,
    StateUpdated,
    Pinned,
    Flooded,
    ReplacementAttempted,
    Confirmed,
    Done,
}

impl PinningState {
    pub fn next(self) -> Option<PinningState> {
        match self {
            PinningState::Init => Some(PinningState::ChannelsFunded),
            PinningState::ChannelsFunded => Some(PinningState::StateUpdated),
            PinningState::StateUpdated => Some(PinningState::Pinned),
            PinningState::Pinned => Some(PinningState::Flooded),
            PinningState::Flooded => Some(PinningState::ReplacementAttempted),
            PinningState::ReplacementAttempted => Some(PinningState::Confirmed),
            PinningState::Confirmed => Some(PinningState::Done),
            PinningState::Done => None,
        }
    }
}

/// Alice routes an HTLC to Carol through Bob. Carol claims her side with the
/// preimage and pins the claim while the Bob-Carol timelock expires, then
/// Alice times out her side. Bob pays forward without getting paid back.
pub struct PinningScenario<L: Ledger> {
    variant: PinningVariant,
    state: PinningState,
    orchestrator: Orchestrator<L>,
    plan: BlockFill,
    secp: Secp256k1<All>,
    alice: Party,
    bob: Party,
    carol: Party,
    coins: Vec<Coin>,
    ab_funding: Option<Coin>,
    bc_funding: Option<Coin>,
    ab: Option<ChannelUpdate>,
    bc: Option<ChannelUpdate>,
    junk_child: Option<SignedTx>,
}

impl<L: Ledger> PinningScenario<L> {
    pub fn new(variant: PinningVariant, orchestrator: Orchestrator<L>) -> Self {
        let secp = Secp256k1::new();
        let alice = Party::generate(&secp, "alice");
        let bob = Party::generate(&secp, "bob");
        let carol = Party::generate(&secp, "carol");
        Self {
            variant,
            state: PinningState::Init,
            orchestrator,
            plan: BlockFill::default(),
            secp,
            alice,
            bob,
            carol,
            coins: vec![],
            ab_funding: None,
            bc_funding: None,
            ab: None,
            bc: None,
            junk_child: None,
        }
    }

    pub fn state(&self) -> PinningState {
        self.state
    }

    pub fn orchestrator(&self) -> &Orchestrator<L> {
        &self.orchestrator
    }

    pub fn into_orchestrator(self) -> Orchestrator<L> {
        self.orchestrator
    }

    /// Bob's node, or Alice's when only one node is configured.
    fn bob_node(&self) -> usize {
        1.min(self.orchestrator.node_count().saturating_sub(1))
    }

    fn all_nodes(&self) -> std::ops::Range<usize> {
        0..self.orchestrator.node_count()
    }

    fn coins_needed(&self) -> usize {
        2 + 2 * FLOOD_BATCHES * self.plan.txs_per_block()
    }

    fn transition(&mut self, to: PinningState) -> Result<(), ScenarioError> {
        if self.state.next() != Some(to) {
            return Err(ScenarioError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!(variant = self.variant.name(), "{:?} -> {:?}", self.state, to);
        self.state = to;
        Ok(())
    }

    /// Drives the scenario from its current state to [`PinningState::Done`].
    pub async fn run(&mut self) -> Result<(), ScenarioError> {
        while self.state != PinningState::Done {
            self.advance().await?;
        }
        Ok(())
    }

    pub async fn advance(&mut self) -> Result<PinningState, ScenarioError> {
        match self.state {
            PinningState::Init => self.fund_channels().await?,
            PinningState::ChannelsFunded => self.update_channels().await?,
            PinningState::StateUpdated => self.pin().await?,
            PinningState::Pinned => self.flood_and_check().await?,
            PinningState::Flooded => self.attempt_replacement().await?,
            PinningState::ReplacementAttempted => self.confirm().await?,
            PinningState::Confirmed => self.finish().await?,
            PinningState::Done => {
                return Err(ScenarioError::InvalidTransition {
                    from: PinningState::Done,
                    to: PinningState::Done,
                });
            }
        }
        Ok(self.state)
    }

    fn ab(&self) -> Result<&ChannelUpdate, ScenarioError> {
        self.ab.as_ref().ok_or(ScenarioError::InvalidTransition {
            from: self.state,
            to: PinningState::Pinned,
        })
    }

    fn bc(&self) -> Result<&ChannelUpdate, ScenarioError> {
        self.bc.as_ref().ok_or(ScenarioError::InvalidTransition {
            from: self.state,
            to: PinningState::Pinned,
        })
    }

    async fn load_coins(&mut self) -> Result<(), ScenarioError> {
        let needed = self.coins_needed();
        let mut coins = self.orchestrator.list_unspent(ALICE).await?;
        if coins.len() < needed {
            let count = BOOTSTRAP_BLOCKS.max((needed - coins.len()) as u64 + COINBASE_MATURITY);
            self.orchestrator
                .run(vec![
                    ScenarioStep::MineBlocks {
                        count,
                        node: ALICE,
                    },
                    ScenarioStep::SyncNodes,
                ])
                .await?;
            coins = self.orchestrator.list_unspent(ALICE).await?;
        }
        if coins.len() < needed {
            return Err(ConstructionError::CoinsExhausted {
                needed,
                available: coins.len(),
            }
            .into());
        }
        // Largest first, the two funding coins must cover the capacity
        coins.sort_by(|a, b| b.value.cmp(&a.value));
        self.coins = coins;
        Ok(())
    }

    async fn fund_channels(&mut self) -> Result<(), ScenarioError> {
        self.load_coins().await?;
        if self.coins.len() < 2 {
            return Err(ConstructionError::CoinsExhausted {
                needed: 2,
                available: self.coins.len(),
            }
            .into());
        }
        let ab_coin = self.coins.remove(0);
        let bc_coin = self.coins.remove(0);

        // Alice's wallet funds both channels
        let ab_funding = self
            .orchestrator
            .sign_with_wallet(ALICE, funding_draft(ab_coin, &self.alice, &self.bob)?)
            .await?;
        let bc_funding = self
            .orchestrator
            .sign_with_wallet(ALICE, funding_draft(bc_coin, &self.bob, &self.carol)?)
            .await?;

        self.orchestrator
            .run(vec![
                ScenarioStep::broadcast(&ab_funding, ALICE),
                ScenarioStep::broadcast(&bc_funding, self.bob_node()),
                ScenarioStep::SyncNodes,
                ScenarioStep::contains(&ab_funding, ALICE),
                ScenarioStep::contains(&bc_funding, ALICE),
                ScenarioStep::MineBlocks {
                    count: 1,
                    node: ALICE,
                },
                ScenarioStep::AssertMempoolEmpty { node: ALICE },
                ScenarioStep::SyncNodes,
            ])
            .await?;

        self.ab_funding = Some(Coin::new(ab_funding.txid(), 0, FUNDING_CAPACITY));
        self.bc_funding = Some(Coin::new(bc_funding.txid(), 0, FUNDING_CAPACITY));
        self.transition(PinningState::ChannelsFunded)
    }

    async fn update_channels(&mut self) -> Result<(), ScenarioError> {
        let (Some(ab_funding), Some(bc_funding)) = (self.ab_funding, self.bc_funding) else {
            return Err(ScenarioError::InvalidTransition {
                from: self.state,
                to: PinningState::StateUpdated,
            });
        };
        let height = u32::try_from(self.orchestrator.chain_height(ALICE).await?).map_err(|_| {
            ScenarioError::AssertionFailed {
                step: self.orchestrator.report().steps.len(),
                detail: "chain height does not fit a lock time".to_string(),
            }
        })?;
        let hash_lock = hash160::Hash::hash(&PREIMAGE);
        let sequence = self.variant.update_sequence();

        let ab_state = ChannelState::builder()
            .funding(ab_funding)
            .funder(self.alice.clone())
            .fundee(self.bob.clone())
            .hash_lock(hash_lock)
            .timelock(height + AB_TIMELOCK_DELTA)
            .fee_rate(UPDATE_FEE_RATE)
            .sequence(sequence)
            .build();
        let bc_state = ChannelState::builder()
            .funding(bc_funding)
            .funder(self.bob.clone())
            .fundee(self.carol.clone())
            .hash_lock(hash_lock)
            .timelock(height + BC_TIMELOCK_DELTA)
            .fee_rate(UPDATE_FEE_RATE)
            .sequence(sequence)
            .build();

        self.ab = Some(ab_state.sign_update(&self.secp, PREIMAGE)?);
        self.bc = Some(bc_state.sign_update(&self.secp, PREIMAGE)?);
        info!(
            height,
            ab_timelock = ab_state.timelock(),
            bc_timelock = bc_state.timelock(),
            "Channel states updated"
        );
        self.transition(PinningState::StateUpdated)
    }

    async fn pin(&mut self) -> Result<(), ScenarioError> {
        let bc = self.bc()?;
        let steps = vec![
            ScenarioStep::broadcast(&bc.commitment, ALICE),
            ScenarioStep::broadcast(&bc.preimage, ALICE),
            ScenarioStep::SyncNodes,
            ScenarioStep::contains(&bc.commitment, ALICE),
            ScenarioStep::contains(&bc.preimage, ALICE),
        ];
        self.orchestrator.run(steps).await?;
        self.transition(PinningState::Pinned)
    }

    /// Fills `FLOOD_BATCHES` blocks with wallet-funded dust fan-outs at rising
    /// fee rates, mines them, and checks the pin survived on every node.
    async fn flood(&mut self) -> Result<(), ScenarioError> {
        let per_flood = FLOOD_BATCHES * self.plan.txs_per_block();
        if self.coins.len() < per_flood {
            return Err(ConstructionError::CoinsExhausted {
                needed: per_flood,
                available: self.coins.len(),
            }
            .into());
        }
        let coins: Vec<Coin> = self.coins.drain(..per_flood).collect();
        let drafts = batch_for_block_weight(
            &coins,
            FLOOD_STARTING_FEERATE,
            FLOOD_FEERATE_STEP,
            FLOOD_BATCHES,
            &self.plan,
            &ContractScript::trivial().script_pubkey(),
        )?;
        let fillers = self
            .orchestrator
            .sign_batch_with_wallet(ALICE, drafts)
            .await?;
        let mut steps: Vec<ScenarioStep> = fillers
            .iter()
            .map(|filler| ScenarioStep::broadcast(filler, ALICE))
            .collect();
        info!("Flooding with {} filler transactions", steps.len());
        steps.push(ScenarioStep::MineBlocks {
            count: FLOOD_BATCHES as u64,
            node: ALICE,
        });
        steps.push(ScenarioStep::SyncNodes);

        let bc = self.bc()?;
        for node in self.all_nodes() {
            steps.push(ScenarioStep::contains(&bc.commitment, node));
            steps.push(ScenarioStep::contains(&bc.preimage, node));
            if let Some(child) = &self.junk_child {
                steps.push(ScenarioStep::contains(child, node));
            }
        }
        self.orchestrator.run(steps).await
    }

    async fn flood_and_check(&mut self) -> Result<(), ScenarioError> {
        self.flood().await?;
        self.transition(PinningState::Flooded)
    }

    async fn attempt_replacement(&mut self) -> Result<(), ScenarioError> {
        let bc = self.bc()?.clone();
        let bumped = bc
            .state
            .with_update(BUMPED_FEE_RATE, bc.state.timelock(), Sequence::MAX)
            .sign_update(&self.secp, PREIMAGE)?;
        let bumped_timeout = bc
            .state
            .bumped_timeout(&self.secp, &bc.commitment, BUMPED_FEE_RATE)?;

        // The commitment alone is still replaceable
        let mut steps = vec![ScenarioStep::accepted(&bumped.commitment, ALICE)];
        if self.variant == PinningVariant::AbsoluteFee {
            let child = junk_child(&bc.preimage, JUNK_CHILD_FEERATE, JUNK_CHILD_ABSOLUTE_FEE)?;
            steps.push(ScenarioStep::broadcast(&child, ALICE));
            steps.push(ScenarioStep::contains(&child, ALICE));
            self.junk_child = Some(child);
        }
        steps.push(ScenarioStep::rejected(
            &bumped_timeout,
            self.variant.expected_rejection(),
            ALICE,
        ));
        self.orchestrator.run(steps).await?;
        self.transition(PinningState::ReplacementAttempted)
    }

    async fn confirm(&mut self) -> Result<(), ScenarioError> {
        self.flood().await?;
        let ab = self.ab()?;
        let steps = vec![
            ScenarioStep::broadcast(&ab.commitment, ALICE),
            ScenarioStep::broadcast(&ab.timeout, ALICE),
            ScenarioStep::SyncNodes,
            ScenarioStep::contains(&ab.commitment, ALICE),
            ScenarioStep::contains(&ab.timeout, ALICE),
            ScenarioStep::MineBlocks {
                count: 1,
                node: ALICE,
            },
        ];
        self.orchestrator.run(steps).await?;
        self.transition(PinningState::Confirmed)
    }

    async fn finish(&mut self) -> Result<(), ScenarioError> {
        let mut steps = vec![ScenarioStep::SyncNodes];
        steps.extend(
            self.all_nodes()
                .map(|node| ScenarioStep::AssertMempoolEmpty { node }),
        );
        self.orchestrator.run(steps).await?;

        let lost = self
            .bc()?
            .commitment
            .output(0)
            .map_or(Amount::ZERO, |htlc| htlc.value);
        self.orchestrator.report_mut().note(format!(
            "Bob paid the HTLC forward to Carol and timed out backward to Alice, losing {}",
            lost
        ));
        self.transition(PinningState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_advance_linearly() {
        let mut state = PinningState::Init;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(next > state);
            visited.push(next);
            state = next;
        }
        assert_eq!(visited.len(), 8);
        assert_eq!(state, PinningState::Done);
    }

    #[test]
    fn test_variant_parameters() {
        assert_eq!(PinningVariant::AbsoluteFee.update_sequence(), Sequence(1));
        assert_eq!(PinningVariant::NoOptIn.update_sequence(), Sequence::MAX);
        assert_eq!(
            PinningVariant::NoOptIn.expected_rejection(),
            "txn-mempool-conflict"
        );
        assert_eq!(
            serde_json::to_string(&PinningVariant::AbsoluteFee).unwrap(),
            "\"absolute-fee\""
        );
    }
}
