use std::time::Duration;

use anyhow::{Result, bail};
use bitcoin::Network;
use clap::Parser;
use htlc_pinning::{
    bitcoin_client::Client,
    config::Config,
    logging,
    retry::{new_backoff_limited, retry},
    scenario::run_scenarios,
    stopper,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    logging::setup(config.log_format);
    info!(
        scenario = config.scenario.name(),
        nodes = config.bitcoin_rpc_urls.len(),
        sync_timeout = config.sync_timeout,
        "Starting htlc-pinning"
    );
    let cancel_token = CancellationToken::new();
    let stopper_handle = stopper::run(cancel_token.clone());

    let mut nodes = vec![];
    for node in config.nodes() {
        let client = Client::new_from_config(&node)?;
        let info = retry(
            || client.get_blockchain_info(),
            "getblockchaininfo",
            new_backoff_limited(config.rpc_retries),
            cancel_token.clone(),
        )
        .await?;
        if info.chain != Network::Regtest {
            bail!(
                "{} is on {}, refusing to run outside regtest",
                node.bitcoin_rpc_url,
                info.chain
            );
        }
        if info.initial_block_download {
            warn!(node = %node.bitcoin_rpc_url, "Node still in initial block download");
        }
        info!(node = %node.bitcoin_rpc_url, height = info.blocks, "Node ready");
        nodes.push(client);
    }
    if nodes.len() < 2 {
        warn!(
            "Only {} node configured, relay between peers is not exercised",
            nodes.len()
        );
    }

    let (reports, result) = run_scenarios(
        config.scenario,
        nodes,
        cancel_token.clone(),
        config.rpc_retries,
        Duration::from_secs(config.sync_timeout),
    )
    .await;
    for report in &reports {
        println!("{}", report);
    }
    cancel_token.cancel();
    let _ = stopper_handle.await;
    if let Err(e) = result {
        error!("Run failed: {}", e);
        return Err(e.into());
    }
    info!("Goodbye.");
    Ok(())
}
