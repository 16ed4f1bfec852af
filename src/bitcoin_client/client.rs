use std::future::Future;

use base64::prelude::*;
use bitcoin::{FeeRate, Transaction, Txid, consensus::encode};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use reqwest::{Client as HttpClient, ClientBuilder, header::HeaderMap};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    assembler::{Coin, SignedTx},
    config::RegtestConfig,
};

use super::{
    error::{BitcoinRpcErrorResponse, Error},
    types::{
        GetBlockchainInfoResult, Request, Response, SignRawTransactionResult,
        TestMempoolAcceptResult, UnspentOutput, Verdict,
    },
};

#[derive(Clone, Debug)]
pub struct Client {
    client: HttpClient,
    url: String,
}

const JSONRPC: &str = "2.0";

/// `maxfeerate` in BTC/kvB from a fee rate; `None` disables the check.
fn max_fee_rate_param(max_fee_rate: Option<FeeRate>) -> Value {
    match max_fee_rate {
        Some(rate) => {
            let sat_per_kvb = rate.to_sat_per_kwu() * 4;
            (sat_per_kvb as f64 / 100_000_000.0).into()
        }
        None => 0.into(),
    }
}

impl Client {
    pub fn new(url: String, user: String, password: String) -> Result<Self, Error> {
        let client = ClientBuilder::new()
            .default_headers({
                let mut headers = HeaderMap::new();
                let auth_str = BASE64_STANDARD.encode(format!("{}:{}", user, password));
                headers.insert("Authorization", format!("Basic {}", auth_str).parse()?);
                headers.insert("Content-Type", "application/json".parse()?);
                headers.insert("Accept", "application/json".parse()?);
                headers
            })
            .build()?;

        Ok(Client { client, url })
    }

    pub fn new_from_config(config: &RegtestConfig) -> Result<Self, Error> {
        Client::new(
            config.bitcoin_rpc_url.clone(),
            config.bitcoin_rpc_user.clone(),
            config.bitcoin_rpc_password.clone(),
        )
    }

    fn handle_response<T>(response: Response) -> Result<T, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        match (response.result, response.error) {
            (Some(result), None) => Ok(serde_json::from_value(result)?),
            (None, Some(error)) => {
                let detail: BitcoinRpcErrorResponse = serde_json::from_value(error)?;
                Err(Error::BitcoinRpc {
                    code: detail.code,
                    message: detail.message,
                })
            }
            // Methods returning JSON null, e.g. a void call
            (None, None) => Ok(serde_json::from_value(Value::Null)?),
            (Some(_), Some(_)) => Err(Error::Unexpected(
                "Both result and error present in RPC response".to_string(),
            )),
        }
    }

    pub async fn call<T>(&self, method: &str, params: Vec<Value>) -> Result<T, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let request = Request {
            jsonrpc: JSONRPC.to_owned(),
            id: "0".to_string(),
            method: method.to_string(),
            params,
        };

        debug!(url = %self.url, method, "RPC call");
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .json::<Response>()
            .await?;

        Self::handle_response(response)
    }

    pub async fn batch_call<T>(
        &self,
        calls: Vec<(String, Vec<Value>)>,
    ) -> Result<Vec<Result<T, Error>>, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let requests: Vec<Request> = calls
            .into_iter()
            .enumerate()
            .map(|(i, (method, params))| Request {
                jsonrpc: JSONRPC.to_owned(),
                id: format!("{}", i),
                method,
                params,
            })
            .collect();

        debug!(url = %self.url, calls = requests.len(), "RPC batch");
        let responses = self
            .client
            .post(&self.url)
            .json(&requests)
            .send()
            .await?
            .json::<Vec<Response>>()
            .await?;

        if responses.len() != requests.len() {
            return Err(Error::Unexpected(format!(
                "Batch of {} calls answered with {} responses",
                requests.len(),
                responses.len()
            )));
        }
        Ok(responses.into_iter().map(Self::handle_response).collect())
    }

    pub async fn get_blockchain_info(&self) -> Result<GetBlockchainInfoResult, Error> {
        self.call("getblockchaininfo", vec![]).await
    }

    pub async fn test_mempool_accept(
        &self,
        raw_txs: &[String],
    ) -> Result<Vec<TestMempoolAcceptResult>, Error> {
        // Wallet-funded transactions pay far above the default fee-rate ceiling
        self.call(
            "testmempoolaccept",
            vec![raw_txs.into(), max_fee_rate_param(None)],
        )
        .await
    }

    pub async fn send_raw_transaction(
        &self,
        raw_tx: &str,
        max_fee_rate: Option<FeeRate>,
    ) -> Result<Txid, Error> {
        self.call(
            "sendrawtransaction",
            vec![raw_tx.into(), max_fee_rate_param(max_fee_rate)],
        )
        .await
        .map_err(Error::classify)
    }

    pub async fn get_raw_mempool(&self) -> Result<Vec<Txid>, Error> {
        self.call("getrawmempool", vec![]).await
    }

    pub async fn get_block_count(&self) -> Result<u64, Error> {
        self.call("getblockcount", vec![]).await
    }

    pub async fn get_new_address(&self) -> Result<String, Error> {
        self.call("getnewaddress", vec![]).await
    }

    pub async fn generate_to_address(&self, blocks: u64, address: &str) -> Result<Vec<String>, Error> {
        self.call("generatetoaddress", vec![blocks.into(), address.into()])
            .await
    }

    pub async fn list_unspent_outputs(&self) -> Result<Vec<UnspentOutput>, Error> {
        self.call("listunspent", vec![]).await
    }

    pub async fn sign_raw_transaction_with_wallet(
        &self,
        raw_tx: &str,
    ) -> Result<SignRawTransactionResult, Error> {
        self.call("signrawtransactionwithwallet", vec![raw_tx.into()])
            .await
    }
}

/// Ledger, mempool and wallet operations a scenario needs from one node.
pub trait Ledger: Send + Sync + Clone + 'static {
    fn submit_transaction(
        &self,
        tx: &SignedTx,
        max_fee_rate: Option<FeeRate>,
    ) -> impl Future<Output = Result<Txid, Error>> + Send;

    fn test_acceptance(
        &self,
        tx: &SignedTx,
    ) -> impl Future<Output = Result<Verdict, Error>> + Send;

    fn list_mempool_ids(&self) -> impl Future<Output = Result<Vec<Txid>, Error>> + Send;

    fn list_unspent(&self) -> impl Future<Output = Result<Vec<Coin>, Error>> + Send;

    /// Mines `count` blocks to a fresh wallet address and returns the new
    /// chain height.
    fn mine_blocks(&self, count: u64) -> impl Future<Output = Result<u64, Error>> + Send;

    fn get_chain_height(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    fn sign_with_wallet(
        &self,
        tx: Transaction,
    ) -> impl Future<Output = Result<SignedTx, Error>> + Send;

    /// Signs `txs` with the node wallet, keeping their order.
    fn sign_batch_with_wallet(
        &self,
        txs: Vec<Transaction>,
    ) -> impl Future<Output = Result<Vec<SignedTx>, Error>> + Send {
        async move {
            let mut signed = Vec::with_capacity(txs.len());
            for tx in txs {
                signed.push(self.sign_with_wallet(tx).await?);
            }
            Ok(signed)
        }
    }
}

impl Ledger for Client {
    async fn submit_transaction(
        &self,
        tx: &SignedTx,
        max_fee_rate: Option<FeeRate>,
    ) -> Result<Txid, Error> {
        self.send_raw_transaction(&tx.raw_hex(), max_fee_rate).await
    }

    async fn test_acceptance(&self, tx: &SignedTx) -> Result<Verdict, Error> {
        let mut results = self.test_mempool_accept(&[tx.raw_hex()]).await?;
        results.pop().map(Verdict::from).ok_or_else(|| {
            Error::Unexpected("Empty testmempoolaccept result".to_string())
        })
    }

    async fn list_mempool_ids(&self) -> Result<Vec<Txid>, Error> {
        self.get_raw_mempool().await
    }

    async fn list_unspent(&self) -> Result<Vec<Coin>, Error> {
        Ok(self
            .list_unspent_outputs()
            .await?
            .iter()
            .filter(|utxo| utxo.spendable)
            .map(Coin::from)
            .collect())
    }

    async fn mine_blocks(&self, count: u64) -> Result<u64, Error> {
        let address = self.get_new_address().await?;
        self.generate_to_address(count, &address).await?;
        self.get_block_count().await
    }

    async fn get_chain_height(&self) -> Result<u64, Error> {
        self.get_block_count().await
    }

    async fn sign_with_wallet(&self, tx: Transaction) -> Result<SignedTx, Error> {
        let raw = hex::encode(encode::serialize(&tx));
        signed_from_wallet(self.sign_raw_transaction_with_wallet(&raw).await?)
    }

    async fn sign_batch_with_wallet(&self, txs: Vec<Transaction>) -> Result<Vec<SignedTx>, Error> {
        let calls = txs
            .iter()
            .map(|tx| {
                (
                    "signrawtransactionwithwallet".to_owned(),
                    vec![hex::encode(encode::serialize(tx)).into()],
                )
            })
            .collect();
        let results: Vec<Result<SignRawTransactionResult, Error>> = self.batch_call(calls).await?;
        results
            .into_par_iter()
            .map(|result| result.and_then(signed_from_wallet))
            .collect()
    }
}

fn signed_from_wallet(result: SignRawTransactionResult) -> Result<SignedTx, Error> {
    if !result.complete {
        let detail = result
            .errors
            .iter()
            .map(|e| format!("{}:{} {}", e.txid, e.vout, e.error))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::SigningFailed(detail));
    }
    let signed: Transaction = encode::deserialize_hex(&result.hex)?;
    Ok(SignedTx::from_ledger(signed))
}
