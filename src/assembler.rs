use bitcoin::{
    Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Weight, Witness,
    absolute::LockTime, transaction::Version,
};
use serde::{Deserialize, Serialize};

use crate::error::ConstructionError;

/// Minimum value of any output the assembler creates (P2WSH dust limit).
pub const DUST_FLOOR: Amount = Amount::from_sat(330);

/// Measured virtual sizes of the contract transaction shapes.
pub const COMMITMENT_VSIZE: u64 = 158;
pub const TIMEOUT_VSIZE: u64 = 158;
pub const PREIMAGE_VSIZE: u64 = 148;
pub const CHILD_MIN_VSIZE: u64 = 96;
/// Virtual size added by one P2WSH output.
pub const OUTPUT_VSIZE: u64 = 43;

/// A spendable output known to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: Amount,
}

impl Coin {
    pub fn new(txid: Txid, vout: u32, value: Amount) -> Self {
        Self {
            outpoint: OutPoint { txid, vout },
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fee(Amount);

impl Fee {
    /// Fee for a transaction shape of known virtual size at `sat_per_vbyte`.
    pub fn for_vsize(vsize: u64, sat_per_vbyte: u64) -> Result<Self, ConstructionError> {
        vsize
            .checked_mul(sat_per_vbyte)
            .map(|sat| Fee(Amount::from_sat(sat)))
            .ok_or(ConstructionError::ValueOverflow)
    }

    pub fn absolute(amount: Amount) -> Self {
        Fee(amount)
    }

    pub fn amount(&self) -> Amount {
        self.0
    }
}

/// Output shaping for [`assemble`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Single output carrying everything but the fee.
    Spend,
    /// Single output of exactly `capacity`; the rest of the inputs is fee.
    Fund { capacity: Amount },
    /// `shards` dust outputs followed by one change output.
    FanOut { shards: u64 },
    /// `to_add` dust outputs followed by one change output, used to inflate
    /// the absolute fee of a pinned subtree.
    JunkChild { to_add: u64 },
}

/// Unsigned transaction under construction.
///
/// A draft can be inspected and hashed for signing but exposes no txid; it is
/// turned into a [`SignedTx`] exactly once by [`Draft::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    tx: Transaction,
    input_values: Vec<Amount>,
}

impl Draft {
    pub fn unsigned(&self) -> &Transaction {
        &self.tx
    }

    pub fn input_value(&self, index: usize) -> Option<Amount> {
        self.input_values.get(index).copied()
    }

    pub fn fee(&self) -> Amount {
        let inputs: Amount = self.input_values.iter().copied().sum();
        let outputs: Amount = self.tx.output.iter().map(|o| o.value).sum();
        inputs - outputs
    }

    /// Attaches one witness per input and freezes the transaction.
    pub fn finalize(mut self, witnesses: Vec<Witness>) -> Result<SignedTx, ConstructionError> {
        if witnesses.len() != self.tx.input.len() {
            return Err(ConstructionError::WitnessCount {
                inputs: self.tx.input.len(),
                witnesses: witnesses.len(),
            });
        }
        for (input, witness) in self.tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }
        Ok(SignedTx::new(self.tx))
    }

    /// Hands the unsigned transaction to an external signer, such as a
    /// node wallet. The result re-enters through [`SignedTx::from_ledger`].
    pub fn into_unsigned(self) -> Transaction {
        self.tx
    }
}

/// Transaction whose fields are frozen and whose txid is computed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Transaction", into = "Transaction")]
pub struct SignedTx {
    tx: Transaction,
    txid: Txid,
}

impl SignedTx {
    fn new(tx: Transaction) -> Self {
        let txid = tx.compute_txid();
        Self { tx, txid }
    }

    pub fn from_ledger(tx: Transaction) -> Self {
        Self::new(tx)
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn vsize(&self) -> u64 {
        self.tx.vsize() as u64
    }

    pub fn weight(&self) -> Weight {
        self.tx.weight()
    }

    pub fn output(&self, vout: u32) -> Option<Coin> {
        self.tx
            .output
            .get(vout as usize)
            .map(|o| Coin::new(self.txid, vout, o.value))
    }

    pub fn raw_hex(&self) -> String {
        hex::encode(bitcoin::consensus::serialize(&self.tx))
    }
}

impl From<Transaction> for SignedTx {
    fn from(tx: Transaction) -> Self {
        SignedTx::new(tx)
    }
}

impl From<SignedTx> for Transaction {
    fn from(signed: SignedTx) -> Self {
        signed.tx
    }
}

fn total_value(inputs: &[Coin]) -> Result<Amount, ConstructionError> {
    inputs.iter().try_fold(Amount::ZERO, |acc, coin| {
        acc.checked_add(coin.value)
            .ok_or(ConstructionError::ValueOverflow)
    })
}

fn change_after(
    available: Amount,
    fee: Amount,
    dust_outputs: u64,
) -> Result<Amount, ConstructionError> {
    let required = DUST_FLOOR
        .checked_mul(dust_outputs)
        .and_then(|dust| dust.checked_add(fee))
        .ok_or(ConstructionError::ValueOverflow)?;
    let change = available
        .checked_sub(required)
        .ok_or(ConstructionError::InsufficientFunds {
            available,
            required,
        })?;
    if change < DUST_FLOOR {
        return Err(ConstructionError::Dust {
            value: change,
            floor: DUST_FLOOR,
        });
    }
    Ok(change)
}

pub fn assemble(
    intent: Intent,
    inputs: &[Coin],
    fee: Fee,
    locking_script: &ScriptBuf,
    locktime: LockTime,
    sequence: Sequence,
) -> Result<Draft, ConstructionError> {
    if inputs.is_empty() {
        return Err(ConstructionError::NoInputs);
    }
    let available = total_value(inputs)?;
    let output = |value| TxOut {
        value,
        script_pubkey: locking_script.clone(),
    };

    let outputs = match intent {
        Intent::Spend => vec![output(change_after(available, fee.amount(), 0)?)],
        Intent::Fund { capacity } => {
            if capacity < DUST_FLOOR {
                return Err(ConstructionError::Dust {
                    value: capacity,
                    floor: DUST_FLOOR,
                });
            }
            if capacity > available {
                return Err(ConstructionError::InsufficientFunds {
                    available,
                    required: capacity,
                });
            }
            vec![output(capacity)]
        }
        Intent::FanOut { shards: dust } | Intent::JunkChild { to_add: dust } => {
            let change = change_after(available, fee.amount(), dust)?;
            let mut outputs: Vec<TxOut> = (0..dust).map(|_| output(DUST_FLOOR)).collect();
            outputs.push(output(change));
            outputs
        }
    };

    let tx = Transaction {
        version: Version::ONE,
        lock_time: locktime,
        input: inputs
            .iter()
            .map(|coin| TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            })
            .collect(),
        output: outputs,
    };

    Ok(Draft {
        tx,
        input_values: inputs.iter().map(|coin| coin.value).collect(),
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::script::ContractScript;

    fn coin(value: u64) -> Coin {
        Coin::new(
            Txid::from_str("ce18ea0cdbd14cb35eccdd0a1d551509d83516c7b3534c83b2a0adb552809caf")
                .unwrap(),
            0,
            Amount::from_sat(value),
        )
    }

    fn sink() -> ScriptBuf {
        ContractScript::trivial().script_pubkey()
    }

    #[test]
    fn test_spend_subtracts_fee() {
        let draft = assemble(
            Intent::Spend,
            &[coin(999_998_000)],
            Fee::for_vsize(COMMITMENT_VSIZE, 2).unwrap(),
            &sink(),
            LockTime::ZERO,
            Sequence(1),
        )
        .unwrap();
        let tx = draft.unsigned();
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, Amount::from_sat(999_998_000 - 316));
        assert_eq!(tx.input[0].sequence, Sequence(1));
        assert_eq!(tx.version, Version::ONE);
        assert_eq!(draft.fee(), Amount::from_sat(316));
    }

    #[test]
    fn test_junk_child_shape() {
        let parent_value = 999_998_000 - 316 - 296;
        let draft = assemble(
            Intent::JunkChild { to_add: 22 },
            &[coin(parent_value)],
            Fee::absolute(Amount::from_sat(2192)),
            &sink(),
            LockTime::ZERO,
            Sequence(1),
        )
        .unwrap();
        let tx = draft.unsigned();
        assert_eq!(tx.output.len(), 23);
        assert!(tx.output[..22].iter().all(|o| o.value == DUST_FLOOR));
        assert_eq!(
            tx.output[22].value,
            Amount::from_sat(parent_value - 2192 - 330 * 22)
        );
        assert_eq!(draft.fee(), Amount::from_sat(2192));
    }

    #[test]
    fn test_fund_keeps_exact_capacity() {
        let draft = assemble(
            Intent::Fund {
                capacity: Amount::from_sat(999_998_000),
            },
            &[coin(5_000_000_000)],
            Fee::absolute(Amount::ZERO),
            &sink(),
            LockTime::ZERO,
            Sequence::MAX,
        )
        .unwrap();
        assert_eq!(
            draft.unsigned().output[0].value,
            Amount::from_sat(999_998_000)
        );
        assert_eq!(draft.fee(), Amount::from_sat(4_000_002_000));
    }

    #[test]
    fn test_insufficient_funds() {
        let err = assemble(
            Intent::Spend,
            &[coin(1000)],
            Fee::for_vsize(TIMEOUT_VSIZE, 10).unwrap(),
            &sink(),
            LockTime::ZERO,
            Sequence::MAX,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConstructionError::InsufficientFunds {
                available: Amount::from_sat(1000),
                required: Amount::from_sat(1580),
            }
        );
    }

    #[test]
    fn test_sub_dust_change_rejected() {
        let err = assemble(
            Intent::FanOut { shards: 2 },
            &[coin(330 * 2 + 100 + 329)],
            Fee::absolute(Amount::from_sat(100)),
            &sink(),
            LockTime::ZERO,
            Sequence::MAX,
        )
        .unwrap_err();
        assert!(matches!(err, ConstructionError::Dust { .. }));
    }

    #[test]
    fn test_no_inputs() {
        let err = assemble(
            Intent::Spend,
            &[],
            Fee::absolute(Amount::ZERO),
            &sink(),
            LockTime::ZERO,
            Sequence::MAX,
        )
        .unwrap_err();
        assert_eq!(err, ConstructionError::NoInputs);
    }

    #[test]
    fn test_finalize_round_trips_through_consensus_encoding() {
        let draft = assemble(
            Intent::Spend,
            &[coin(100_000)],
            Fee::for_vsize(PREIMAGE_VSIZE, 2).unwrap(),
            &sink(),
            LockTime::from_consensus(120),
            Sequence(1),
        )
        .unwrap();
        let witness = Witness::from_slice(&[vec![0x51u8]]);
        let signed = draft.finalize(vec![witness]).unwrap();
        let bytes = bitcoin::consensus::serialize(signed.tx());
        let decoded: Transaction = bitcoin::consensus::deserialize(&bytes).unwrap();
        assert_eq!(&decoded, signed.tx());
        assert_eq!(decoded.compute_txid(), signed.txid());
        assert_eq!(decoded.input[0].witness.len(), 1);
    }

    #[test]
    fn test_fee_overflow() {
        assert_eq!(
            Fee::for_vsize(u64::MAX / 2, 3).unwrap_err(),
            ConstructionError::ValueOverflow
        );
        assert_eq!(
            Fee::for_vsize(TIMEOUT_VSIZE, 10).unwrap().amount(),
            Amount::from_sat(1580)
        );
    }

    #[test]
    fn test_finalize_needs_one_witness_per_input() {
        let draft = assemble(
            Intent::Spend,
            &[coin(100_000)],
            Fee::absolute(Amount::from_sat(1_000)),
            &sink(),
            LockTime::ZERO,
            Sequence::MAX,
        )
        .unwrap();
        assert_eq!(
            draft.clone().finalize(vec![]).unwrap_err(),
            ConstructionError::WitnessCount {
                inputs: 1,
                witnesses: 0
            }
        );
        let witness = Witness::from_slice(&[vec![0x51u8]]);
        assert!(draft.finalize(vec![witness.clone(), witness]).is_err());
    }
}
