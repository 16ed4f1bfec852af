use std::{collections::HashMap, str::FromStr};

use bitcoin::{
    Amount, OutPoint, Sequence, Transaction, TxOut, Txid,
    hashes::{Hash, hash160},
    secp256k1::{Secp256k1, SecretKey},
};
use htlc_pinning::{
    assembler::{Coin, SignedTx},
    channel::{ChannelState, FUNDING_CAPACITY, Party, funding_script, junk_child},
    scenario::{PinningVariant, pinning::PREIMAGE},
};

/// Outputs of every transaction the scenario could spend from.
#[derive(Default)]
struct Spendable(HashMap<OutPoint, TxOut>);

impl Spendable {
    fn add(&mut self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for (vout, output) in tx.output.iter().enumerate() {
            self.0.insert(
                OutPoint {
                    txid,
                    vout: vout as u32,
                },
                output.clone(),
            );
        }
    }

    fn verify(&self, tx: &SignedTx) {
        tx.tx()
            .verify(|outpoint| self.0.get(outpoint).cloned())
            .unwrap_or_else(|e| panic!("{} fails script validation: {:?}", tx.txid(), e));
    }
}

fn channel(variant: PinningVariant) -> (ChannelState, Spendable) {
    let secp = Secp256k1::new();
    let bob = Party::new(&secp, "bob", SecretKey::from_slice(&[0x0b; 32]).unwrap());
    let carol = Party::new(&secp, "carol", SecretKey::from_slice(&[0x0c; 32]).unwrap());
    let funding = Coin::new(
        Txid::from_str("dd3d962f95741f2f5c3b87d6395c325baa75c4f3f04c7652e258f6005d70f3e8").unwrap(),
        0,
        FUNDING_CAPACITY,
    );
    let mut spendable = Spendable::default();
    spendable.0.insert(
        funding.outpoint,
        TxOut {
            value: FUNDING_CAPACITY,
            script_pubkey: funding_script(&bob, &carol).unwrap().script_pubkey(),
        },
    );
    let state = ChannelState::builder()
        .funding(funding)
        .funder(bob)
        .fundee(carol)
        .hash_lock(hash160::Hash::hash(&PREIMAGE))
        .timelock(512)
        .fee_rate(2)
        .sequence(variant.update_sequence())
        .build();
    (state, spendable)
}

fn check_variant(variant: PinningVariant) {
    let secp = Secp256k1::new();
    let (state, mut spendable) = channel(variant);
    let update = state.sign_update(&secp, PREIMAGE).unwrap();
    spendable.verify(&update.commitment);
    spendable.add(update.commitment.tx());
    spendable.verify(&update.timeout);
    spendable.verify(&update.preimage);

    let bumped = state
        .with_update(10, state.timelock(), Sequence::MAX)
        .sign_update(&secp, PREIMAGE)
        .unwrap();
    spendable.verify(&bumped.commitment);
    let bumped_timeout = state
        .bumped_timeout(&secp, &update.commitment, 10)
        .unwrap();
    spendable.verify(&bumped_timeout);

    spendable.add(update.preimage.tx());
    let child = junk_child(&update.preimage, 2, Amount::from_sat(2000)).unwrap();
    spendable.verify(&child);
}

#[test]
fn test_absolute_fee_witnesses_validate() {
    check_variant(PinningVariant::AbsoluteFee);
}

#[test]
fn test_no_opt_in_witnesses_validate() {
    check_variant(PinningVariant::NoOptIn);
}

#[test]
fn test_wrong_spent_amount_fails_validation() {
    let secp = Secp256k1::new();
    let (state, mut spendable) = channel(PinningVariant::AbsoluteFee);
    let update = state.sign_update(&secp, PREIMAGE).unwrap();
    for output in spendable.0.values_mut() {
        output.value = output.value - Amount::from_sat(1);
    }
    assert!(
        update
            .commitment
            .tx()
            .verify(|outpoint| spendable.0.get(outpoint).cloned())
            .is_err()
    );
}
