use bitcoin::{
    CompressedPublicKey, ScriptBuf,
    hashes::{Hash, hash160},
    opcodes::{
        OP_TRUE,
        all::{
            OP_CHECKMULTISIG, OP_CHECKSIG, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY,
            OP_HASH160, OP_NOTIF, OP_PUSHNUM_2, OP_SIZE, OP_SWAP,
        },
    },
    script::Builder,
};

use crate::error::ConstructionError;

/// Size in bytes the HTLC size probe compares the top witness element against.
pub const PREIMAGE_SIZE: i64 = 32;

/// Locking scripts used by the channel transactions.
///
/// Scripts are plain data and can be shared between any number of
/// transactions; the byte encoding is produced on demand and is stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractScript {
    /// `OP_2 <a> <b> OP_2 OP_CHECKMULTISIG`, the channel funding output.
    FundingMultisig {
        pubkey_a: CompressedPublicKey,
        pubkey_b: CompressedPublicKey,
    },
    /// Offered HTLC without revocation path.
    ///
    /// The top witness element is probed with `OP_SIZE`: a 32-byte element
    /// takes the receiver's preimage branch, anything else falls through to
    /// the 2-of-2 timeout branch.
    Htlc {
        receiver: CompressedPublicKey,
        sender: CompressedPublicKey,
        hash_lock: hash160::Hash,
    },
    /// `OP_TRUE`, anyone can spend with the script as the only witness item.
    TrivialTrue,
}

fn parse_key(bytes: &[u8]) -> Result<CompressedPublicKey, ConstructionError> {
    CompressedPublicKey::from_slice(bytes).map_err(|e| ConstructionError::InvalidKey(e.to_string()))
}

pub fn build_funding_script(
    pubkey_a: &[u8],
    pubkey_b: &[u8],
) -> Result<ContractScript, ConstructionError> {
    Ok(ContractScript::FundingMultisig {
        pubkey_a: parse_key(pubkey_a)?,
        pubkey_b: parse_key(pubkey_b)?,
    })
}

pub fn build_htlc_script(
    receiver_pubkey: &[u8],
    sender_pubkey: &[u8],
    hash_lock: hash160::Hash,
) -> Result<ContractScript, ConstructionError> {
    Ok(ContractScript::Htlc {
        receiver: parse_key(receiver_pubkey)?,
        sender: parse_key(sender_pubkey)?,
        hash_lock,
    })
}

impl ContractScript {
    pub fn trivial() -> Self {
        ContractScript::TrivialTrue
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContractScript::FundingMultisig { .. } => "funding-multisig",
            ContractScript::Htlc { .. } => "htlc",
            ContractScript::TrivialTrue => "trivial-true",
        }
    }

    pub fn witness_script(&self) -> ScriptBuf {
        match self {
            ContractScript::FundingMultisig { pubkey_a, pubkey_b } => Builder::new()
                .push_opcode(OP_PUSHNUM_2)
                .push_slice(pubkey_a.to_bytes())
                .push_slice(pubkey_b.to_bytes())
                .push_opcode(OP_PUSHNUM_2)
                .push_opcode(OP_CHECKMULTISIG)
                .into_script(),
            ContractScript::Htlc {
                receiver,
                sender,
                hash_lock,
            } => Builder::new()
                .push_slice(receiver.to_bytes())
                .push_opcode(OP_SWAP)
                .push_opcode(OP_SIZE)
                .push_int(PREIMAGE_SIZE)
                .push_opcode(OP_EQUAL)
                .push_opcode(OP_NOTIF)
                .push_opcode(OP_DROP)
                .push_opcode(OP_PUSHNUM_2)
                .push_opcode(OP_SWAP)
                .push_slice(sender.to_bytes())
                .push_opcode(OP_PUSHNUM_2)
                .push_opcode(OP_CHECKMULTISIG)
                .push_opcode(OP_ELSE)
                .push_opcode(OP_HASH160)
                .push_slice(hash_lock.as_byte_array())
                .push_opcode(OP_EQUALVERIFY)
                .push_opcode(OP_CHECKSIG)
                .push_opcode(OP_ENDIF)
                .into_script(),
            ContractScript::TrivialTrue => Builder::new().push_opcode(OP_TRUE).into_script(),
        }
    }

    /// P2WSH output script committing to [`Self::witness_script`].
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.witness_script().wscript_hash())
    }
}
