use std::fmt;

use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::assembler::Coin;

#[derive(Serialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: String,
    pub method: String,
    pub params: Vec<Value>,
}

#[derive(Deserialize, Debug)]
pub struct Response {
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub id: String,
}

fn deserialize_bip70_network<'de, D>(deserializer: D) -> Result<Network, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct NetworkVisitor;
    impl serde::de::Visitor<'_> for NetworkVisitor {
        type Value = Network;

        fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Self::Value, E> {
            Network::from_core_arg(s).map_err(|_| {
                E::invalid_value(
                    serde::de::Unexpected::Str(s),
                    &"bitcoin network encoded as a string",
                )
            })
        }

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "bitcoin network encoded as a string")
        }
    }

    deserializer.deserialize_str(NetworkVisitor)
}

/// Subset of `getblockchaininfo` used to wait for a node to come up.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetBlockchainInfoResult {
    #[serde(deserialize_with = "deserialize_bip70_network")]
    pub chain: Network,
    pub blocks: u64,
    pub headers: u64,
    #[serde(rename = "initialblockdownload")]
    pub initial_block_download: bool,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct TestMempoolAcceptResult {
    pub txid: Txid,
    pub allowed: bool,
    #[serde(rename = "reject-reason")]
    pub reject_reason: Option<String>,
    pub vsize: Option<u64>,
    pub fees: Option<TestMempoolAcceptResultFees>,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct TestMempoolAcceptResultFees {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub base: Amount,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptBuf,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub amount: Amount,
    pub confirmations: u32,
    pub spendable: bool,
}

impl From<&UnspentOutput> for Coin {
    fn from(utxo: &UnspentOutput) -> Self {
        Coin {
            outpoint: OutPoint {
                txid: utxo.txid,
                vout: utxo.vout,
            },
            value: utxo.amount,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct SignRawTransactionResult {
    pub hex: String,
    pub complete: bool,
    #[serde(default)]
    pub errors: Vec<SignRawTransactionError>,
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct SignRawTransactionError {
    pub txid: Txid,
    pub vout: u32,
    pub error: String,
}

/// Outcome of a dry-run mempool admission.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Verdict {
    pub fn accepted() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

impl From<TestMempoolAcceptResult> for Verdict {
    fn from(result: TestMempoolAcceptResult) -> Self {
        Self {
            allowed: result.allowed,
            reason: result.reject_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_test_mempool_accept() {
        let raw = r#"[{
            "txid": "ca346e6fd745c138eee30f1dbe93ab269231cfb46e5ac945d028cbcc9dd2dea2",
            "wtxid": "ca346e6fd745c138eee30f1dbe93ab269231cfb46e5ac945d028cbcc9dd2dea2",
            "allowed": false,
            "reject-reason": "txn-mempool-conflict"
        }]"#;
        let results: Vec<TestMempoolAcceptResult> = serde_json::from_str(raw).unwrap();
        let verdict = Verdict::from(results[0].clone());
        assert_eq!(verdict, Verdict::rejected("txn-mempool-conflict"));
    }

    #[test]
    fn test_unspent_output_to_coin() {
        let raw = r#"{
            "txid": "ca346e6fd745c138eee30f1dbe93ab269231cfb46e5ac945d028cbcc9dd2dea2",
            "vout": 0,
            "address": "bcrt1qxyz",
            "scriptPubKey": "0014751e76e8199196d454941c45d1b3a323f1433bd6",
            "amount": 50.00000000,
            "confirmations": 101,
            "spendable": true,
            "solvable": true,
            "safe": true
        }"#;
        let utxo: UnspentOutput = serde_json::from_str(raw).unwrap();
        let coin = Coin::from(&utxo);
        assert_eq!(coin.value, Amount::from_btc(50.0).unwrap());
        assert_eq!(coin.outpoint.vout, 0);
    }
}
