use std::sync::Arc;

use bitcoin::{
    Amount, CompressedPublicKey, Sequence,
    absolute::LockTime,
    hashes::{Hash, hash160},
    secp256k1::{All, Secp256k1, SecretKey, rand},
};
use bon::Builder;

use crate::{
    assembler::{
        CHILD_MIN_VSIZE, COMMITMENT_VSIZE, Coin, Draft, Fee, Intent, PREIMAGE_VSIZE, SignedTx,
        TIMEOUT_VSIZE, assemble,
    },
    budget::junk_child_outputs,
    error::{ChannelError, ConstructionError},
    script::{ContractScript, build_funding_script, build_htlc_script},
    signer::{Branch, build_witness, sign_input},
};

/// Value locked in every funding output.
pub const FUNDING_CAPACITY: Amount = Amount::from_sat(999_998_000);

/// Commitments always signal replaceability.
pub const COMMITMENT_SEQUENCE: Sequence = Sequence(0x1);

/// Sequence of the bumped timeout and of junk children.
pub const REPLACEABLE_SEQUENCE: Sequence = Sequence(0x1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    name: String,
    secret_key: SecretKey,
    public_key: CompressedPublicKey,
}

impl Party {
    pub fn new(secp: &Secp256k1<All>, name: impl Into<String>, secret_key: SecretKey) -> Self {
        Self {
            name: name.into(),
            secret_key,
            public_key: CompressedPublicKey(secret_key.public_key(secp)),
        }
    }

    pub fn generate(secp: &Secp256k1<All>, name: impl Into<String>) -> Self {
        Self::new(secp, name, SecretKey::new(&mut rand::thread_rng()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn public_key(&self) -> CompressedPublicKey {
        self.public_key
    }
}

pub fn funding_script(funder: &Party, fundee: &Party) -> Result<ContractScript, ConstructionError> {
    build_funding_script(
        &funder.public_key.to_bytes(),
        &fundee.public_key.to_bytes(),
    )
}

/// Unsigned funding transaction paying [`FUNDING_CAPACITY`] into the 2-of-2
/// output. `coin` is a wallet coin; whatever exceeds the capacity is fee, so
/// the node must be told to skip its fee-rate sanity check.
pub fn funding_draft(coin: Coin, funder: &Party, fundee: &Party) -> Result<Draft, ConstructionError> {
    assemble(
        Intent::Fund {
            capacity: FUNDING_CAPACITY,
        },
        &[coin],
        Fee::absolute(Amount::ZERO),
        &funding_script(funder, fundee)?.script_pubkey(),
        LockTime::ZERO,
        Sequence::ZERO,
    )
}

/// Snapshot of a channel between `funder` (offers the HTLC) and `fundee`
/// (can claim it with the preimage).
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct ChannelState {
    funding: Coin,
    funder: Party,
    fundee: Party,
    hash_lock: hash160::Hash,
    /// Absolute height after which the funder may time the HTLC out.
    timelock: u32,
    /// sat/vB paid by each transaction of the update.
    fee_rate: u64,
    /// Sequence of the timeout and preimage inputs.
    #[builder(default = Sequence::MAX)]
    sequence: Sequence,
}

/// Transactions derived from one channel state.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub state: Arc<ChannelState>,
    pub commitment: SignedTx,
    pub timeout: SignedTx,
    pub preimage: SignedTx,
}

impl ChannelState {
    pub fn funding(&self) -> Coin {
        self.funding
    }

    pub fn timelock(&self) -> u32 {
        self.timelock
    }

    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    pub fn funder(&self) -> &Party {
        &self.funder
    }

    pub fn fundee(&self) -> &Party {
        &self.fundee
    }

    pub fn funding_script(&self) -> Result<ContractScript, ConstructionError> {
        funding_script(&self.funder, &self.fundee)
    }

    pub fn htlc_script(&self) -> Result<ContractScript, ConstructionError> {
        build_htlc_script(
            &self.fundee.public_key.to_bytes(),
            &self.funder.public_key.to_bytes(),
            self.hash_lock,
        )
    }

    /// New snapshot of the same channel with different update parameters.
    pub fn with_update(&self, fee_rate: u64, timelock: u32, sequence: Sequence) -> ChannelState {
        ChannelState {
            fee_rate,
            timelock,
            sequence,
            ..self.clone()
        }
    }

    /// Builds and signs the commitment spending the funding output, the
    /// funder's timeout and the fundee's preimage claim, both spending the
    /// commitment's HTLC output.
    pub fn sign_update(
        &self,
        secp: &Secp256k1<All>,
        preimage: [u8; 32],
    ) -> Result<ChannelUpdate, ChannelError> {
        if hash160::Hash::hash(&preimage) != self.hash_lock {
            return Err(ChannelError::PreimageMismatch);
        }
        let funding_script = self.funding_script()?;
        let htlc_script = self.htlc_script()?;
        let sink = ContractScript::trivial().script_pubkey();

        let draft = assemble(
            Intent::Spend,
            &[self.funding],
            Fee::for_vsize(COMMITMENT_VSIZE, self.fee_rate)?,
            &htlc_script.script_pubkey(),
            LockTime::ZERO,
            COMMITMENT_SEQUENCE,
        )?;
        let witness = sign_input(
            secp,
            &draft,
            0,
            &funding_script,
            self.funding.value,
            &Branch::Multisig,
            &[&self.funder.secret_key, &self.fundee.secret_key],
        )?;
        let commitment = draft.finalize(vec![witness])?;
        let htlc = commitment
            .output(0)
            .ok_or(ChannelError::MissingOutput(commitment.txid()))?;

        let draft = assemble(
            Intent::Spend,
            &[htlc],
            Fee::for_vsize(TIMEOUT_VSIZE, self.fee_rate)?,
            &sink,
            LockTime::from_consensus(self.timelock),
            self.sequence,
        )?;
        let witness = sign_input(
            secp,
            &draft,
            0,
            &htlc_script,
            htlc.value,
            &Branch::Timeout,
            &[&self.fundee.secret_key, &self.funder.secret_key],
        )?;
        let timeout = draft.finalize(vec![witness])?;

        let draft = assemble(
            Intent::Spend,
            &[htlc],
            Fee::for_vsize(PREIMAGE_VSIZE, self.fee_rate)?,
            &sink,
            LockTime::ZERO,
            self.sequence,
        )?;
        let witness = sign_input(
            secp,
            &draft,
            0,
            &htlc_script,
            htlc.value,
            &Branch::Preimage(preimage),
            &[&self.fundee.secret_key],
        )?;
        let preimage = draft.finalize(vec![witness])?;

        Ok(ChannelUpdate {
            state: Arc::new(self.clone()),
            commitment,
            timeout,
            preimage,
        })
    }

    /// Timeout of the HTLC output of an already broadcast `commitment`,
    /// paying `fee_rate` and signalling replaceability.
    pub fn bumped_timeout(
        &self,
        secp: &Secp256k1<All>,
        commitment: &SignedTx,
        fee_rate: u64,
    ) -> Result<SignedTx, ChannelError> {
        let htlc_script = self.htlc_script()?;
        let htlc = commitment
            .output(0)
            .ok_or(ChannelError::MissingOutput(commitment.txid()))?;
        let draft = assemble(
            Intent::Spend,
            &[htlc],
            Fee::for_vsize(TIMEOUT_VSIZE, fee_rate)?,
            &ContractScript::trivial().script_pubkey(),
            LockTime::from_consensus(self.timelock),
            REPLACEABLE_SEQUENCE,
        )?;
        let witness = sign_input(
            secp,
            &draft,
            0,
            &htlc_script,
            htlc.value,
            &Branch::Timeout,
            &[&self.fundee.secret_key, &self.funder.secret_key],
        )?;
        Ok(draft.finalize(vec![witness])?)
    }
}

/// Child of `parent`'s first output padded with dust outputs so the subtree
/// carries at least `absolute_fee` more fee while its fee rate stays near
/// `target_feerate`.
pub fn junk_child(
    parent: &SignedTx,
    target_feerate: u64,
    absolute_fee: Amount,
) -> Result<SignedTx, ChannelError> {
    let coin = parent
        .output(0)
        .ok_or(ChannelError::MissingOutput(parent.txid()))?;
    let to_add = junk_child_outputs(absolute_fee, target_feerate);
    let fee = Fee::absolute(Amount::from_sat(CHILD_MIN_VSIZE * target_feerate) + absolute_fee);
    let trivial = ContractScript::trivial();
    let draft = assemble(
        Intent::JunkChild { to_add },
        &[coin],
        fee,
        &trivial.script_pubkey(),
        LockTime::ZERO,
        REPLACEABLE_SEQUENCE,
    )?;
    let witness = build_witness(&Branch::Trivial, &[], &trivial)?;
    Ok(draft.finalize(vec![witness])?)
}
