use bitcoin::{
    Amount, EcdsaSighashType, Witness,
    ecdsa::Signature,
    hashes::Hash,
    secp256k1::{All, Message, Secp256k1, SecretKey},
    sighash::SighashCache,
};

use crate::{assembler::Draft, error::SignatureError, script::ContractScript};

const EMPTY: &[u8] = &[];

/// Spending path selected when building a witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// 2-of-2 funding output, signatures in script key order.
    Multisig,
    /// HTLC receiver path; the value must pass the 32-byte size probe.
    Preimage([u8; 32]),
    /// HTLC 2-of-2 path, signatures ordered receiver then sender.
    Timeout,
    /// `OP_TRUE` output.
    Trivial,
}

impl Branch {
    pub fn name(&self) -> &'static str {
        match self {
            Branch::Multisig => "multisig",
            Branch::Preimage(_) => "preimage",
            Branch::Timeout => "timeout",
            Branch::Trivial => "trivial",
        }
    }

    fn signatures_required(&self) -> usize {
        match self {
            Branch::Multisig | Branch::Timeout => 2,
            Branch::Preimage(_) => 1,
            Branch::Trivial => 0,
        }
    }
}

/// BIP143 signature hash of `draft`'s input `input_index` spending a P2WSH
/// output locked by `script` and worth `input_amount`.
pub fn sighash(
    script: &ContractScript,
    draft: &Draft,
    input_index: usize,
    sighash_type: EcdsaSighashType,
    input_amount: Amount,
) -> Result<[u8; 32], SignatureError> {
    let tx = draft.unsigned();
    if input_index >= tx.input.len() {
        return Err(SignatureError::InputIndex {
            index: input_index,
            inputs: tx.input.len(),
        });
    }
    let mut cache = SighashCache::new(tx);
    let hash = cache
        .p2wsh_signature_hash(
            input_index,
            &script.witness_script(),
            input_amount,
            sighash_type,
        )
        .map_err(|e| SignatureError::Sighash(e.to_string()))?;
    Ok(hash.to_byte_array())
}

pub fn sign(
    secp: &Secp256k1<All>,
    secret_key: &SecretKey,
    digest: &[u8],
    sighash_type: EcdsaSighashType,
) -> Result<Signature, SignatureError> {
    let msg = Message::from_digest_slice(digest)
        .map_err(|_| SignatureError::InvalidDigestLength(digest.len()))?;
    Ok(Signature {
        signature: secp.sign_ecdsa(&msg, secret_key),
        sighash_type,
    })
}

/// Lays out the witness stack in the order `script`'s `branch` consumes it.
///
/// `OP_CHECKMULTISIG` pops one element more than it uses, hence the leading
/// empty push on the multisig and timeout stacks.
pub fn build_witness(
    branch: &Branch,
    signatures: &[Signature],
    script: &ContractScript,
) -> Result<Witness, SignatureError> {
    let supported = matches!(
        (script, branch),
        (ContractScript::FundingMultisig { .. }, Branch::Multisig)
            | (
                ContractScript::Htlc { .. },
                Branch::Preimage(_) | Branch::Timeout
            )
            | (ContractScript::TrivialTrue, Branch::Trivial)
    );
    if !supported {
        return Err(SignatureError::UnsupportedBranch {
            script: script.name(),
            branch: branch.name(),
        });
    }
    if signatures.len() != branch.signatures_required() {
        return Err(SignatureError::SignatureCount {
            branch: branch.name(),
            expected: branch.signatures_required(),
            got: signatures.len(),
        });
    }

    let witness_script = script.witness_script();
    let mut witness = Witness::new();
    match branch {
        Branch::Multisig => {
            witness.push(EMPTY);
            witness.push(signatures[0].to_vec());
            witness.push(signatures[1].to_vec());
        }
        Branch::Preimage(preimage) => {
            witness.push(signatures[0].to_vec());
            witness.push(preimage);
        }
        Branch::Timeout => {
            witness.push(EMPTY);
            witness.push(signatures[0].to_vec());
            witness.push(signatures[1].to_vec());
            // Fails the size probe, selecting OP_NOTIF
            witness.push(EMPTY);
        }
        Branch::Trivial => {}
    }
    witness.push(witness_script.as_bytes());
    Ok(witness)
}

/// Signs input `input_index` of `draft` with `keys` (in the order the branch
/// expects its signatures) and returns the finished witness.
pub fn sign_input(
    secp: &Secp256k1<All>,
    draft: &Draft,
    input_index: usize,
    script: &ContractScript,
    input_amount: Amount,
    branch: &Branch,
    keys: &[&SecretKey],
) -> Result<Witness, SignatureError> {
    let digest = sighash(
        script,
        draft,
        input_index,
        EcdsaSighashType::All,
        input_amount,
    )?;
    let signatures = keys
        .iter()
        .map(|key| sign(secp, key, &digest, EcdsaSighashType::All))
        .collect::<Result<Vec<_>, _>>()?;
    build_witness(branch, &signatures, script)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::{
        CompressedPublicKey, ScriptBuf, Sequence, Txid, absolute::LockTime, hashes::hash160,
    };

    use super::*;
    use crate::assembler::{COMMITMENT_VSIZE, Coin, Fee, Intent, assemble};
    use crate::script::{build_funding_script, build_htlc_script};

    struct Keys {
        secp: Secp256k1<All>,
        a: SecretKey,
        b: SecretKey,
    }

    impl Keys {
        fn new() -> Self {
            Self {
                secp: Secp256k1::new(),
                a: SecretKey::from_slice(&[0x11; 32]).unwrap(),
                b: SecretKey::from_slice(&[0x22; 32]).unwrap(),
            }
        }

        fn public(&self, key: &SecretKey) -> CompressedPublicKey {
            CompressedPublicKey(key.public_key(&self.secp))
        }
    }

    fn draft(sink: &ScriptBuf) -> Draft {
        let coin = Coin::new(
            Txid::from_str("dd3d962f95741f2f5c3b87d6395c325baa75c4f3f04c7652e258f6005d70f3e8")
                .unwrap(),
            0,
            Amount::from_sat(999_998_000),
        );
        assemble(
            Intent::Spend,
            &[coin],
            Fee::for_vsize(COMMITMENT_VSIZE, 2).unwrap(),
            sink,
            LockTime::ZERO,
            Sequence(1),
        )
        .unwrap()
    }

    #[test]
    fn test_sighash_deterministic() {
        let keys = Keys::new();
        let script = build_funding_script(
            &keys.public(&keys.a).to_bytes(),
            &keys.public(&keys.b).to_bytes(),
        )
        .unwrap();
        let draft = draft(&script.script_pubkey());
        let amount = Amount::from_sat(999_998_000);
        let first = sighash(&script, &draft, 0, EcdsaSighashType::All, amount).unwrap();
        let second = sighash(&script, &draft, 0, EcdsaSighashType::All, amount).unwrap();
        assert_eq!(first, second);

        let other_amount = sighash(
            &script,
            &draft,
            0,
            EcdsaSighashType::All,
            Amount::from_sat(1),
        )
        .unwrap();
        assert_ne!(first, other_amount);
    }

    #[test]
    fn test_sighash_input_out_of_range() {
        let script = ContractScript::trivial();
        let draft = draft(&script.script_pubkey());
        assert_eq!(
            sighash(&script, &draft, 1, EcdsaSighashType::All, Amount::ONE_SAT),
            Err(SignatureError::InputIndex {
                index: 1,
                inputs: 1
            })
        );
    }

    #[test]
    fn test_signature_verifies_and_carries_sighash_byte() {
        let keys = Keys::new();
        let digest = [7u8; 32];
        let sig = sign(&keys.secp, &keys.a, &digest, EcdsaSighashType::All).unwrap();
        let bytes = sig.to_vec();
        assert_eq!(*bytes.last().unwrap(), 0x01);
        let msg = Message::from_digest(digest);
        assert!(
            keys.secp
                .verify_ecdsa(&msg, &sig.signature, &keys.a.public_key(&keys.secp))
                .is_ok()
        );
    }

    #[test]
    fn test_sign_rejects_short_digest() {
        let keys = Keys::new();
        assert_eq!(
            sign(&keys.secp, &keys.a, &[0u8; 20], EcdsaSighashType::All).unwrap_err(),
            SignatureError::InvalidDigestLength(20)
        );
    }

    #[test]
    fn test_timeout_and_preimage_stacks() {
        let keys = Keys::new();
        let receiver = keys.public(&keys.b);
        let sender = keys.public(&keys.a);
        let preimage = [b'a'; 32];
        let script = build_htlc_script(
            &receiver.to_bytes(),
            &sender.to_bytes(),
            hash160::Hash::hash(&preimage),
        )
        .unwrap();
        let draft = draft(&ContractScript::trivial().script_pubkey());
        let amount = Amount::from_sat(999_998_000);

        let timeout = sign_input(
            &keys.secp,
            &draft,
            0,
            &script,
            amount,
            &Branch::Timeout,
            &[&keys.b, &keys.a],
        )
        .unwrap();
        let stack = timeout.to_vec();
        assert_eq!(stack.len(), 5);
        assert!(stack[0].is_empty());
        assert!(stack[3].is_empty());
        assert_eq!(stack[4], script.witness_script().to_bytes());

        let claim = sign_input(
            &keys.secp,
            &draft,
            0,
            &script,
            amount,
            &Branch::Preimage(preimage),
            &[&keys.b],
        )
        .unwrap();
        let stack = claim.to_vec();
        assert_eq!(stack.len(), 3);
        assert_eq!(stack[1], preimage.to_vec());
        assert_eq!(stack[2], script.witness_script().to_bytes());
    }

    #[test]
    fn test_unsupported_branch() {
        let keys = Keys::new();
        let script = build_funding_script(
            &keys.public(&keys.a).to_bytes(),
            &keys.public(&keys.b).to_bytes(),
        )
        .unwrap();
        assert_eq!(
            build_witness(&Branch::Timeout, &[], &script).unwrap_err(),
            SignatureError::UnsupportedBranch {
                script: "funding-multisig",
                branch: "timeout",
            }
        );
        assert!(matches!(
            build_witness(&Branch::Multisig, &[], &script),
            Err(SignatureError::SignatureCount {
                expected: 2,
                got: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_trivial_witness_is_script_only() {
        let witness = build_witness(&Branch::Trivial, &[], &ContractScript::trivial()).unwrap();
        assert_eq!(witness.to_vec(), vec![vec![0x51u8]]);
    }
}
