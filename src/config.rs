use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::{logging, scenario::ScenarioKind};

#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[clap(
    version = "0.1.0",
    about = "HTLC pinning",
    long_about = r#"Reproduces mempool pinning attacks against HTLC payment channels on regtest Bitcoin Core nodes"#
)]
pub struct Config {
    #[clap(
        long,
        env = "LOG_FORMAT",
        help = "Log format (plain, json)",
        default_value = "plain"
    )]
    pub log_format: logging::Format,

    #[clap(
        long,
        env = "BITCOIN_RPC_URLS",
        help = "Comma separated RPC URLs, one per node; the first three play Alice, Bob and Carol (e.g., http://127.0.0.1:18443)",
        value_delimiter = ',',
        required = true
    )]
    pub bitcoin_rpc_urls: Vec<String>,

    #[clap(
        long,
        env = "BITCOIN_RPC_USER",
        help = "User for Bitcoin RPC authentication",
        default_value = "rpc"
    )]
    pub bitcoin_rpc_user: String,

    #[clap(
        long,
        env = "BITCOIN_RPC_PASSWORD",
        help = "Password for Bitcoin RPC authentication",
        default_value = "rpc"
    )]
    pub bitcoin_rpc_password: String,

    #[clap(
        long,
        env = "RPC_RETRIES",
        help = "Retries for transient RPC failures before a step is reported as an infrastructure error",
        default_value = "5"
    )]
    pub rpc_retries: usize,

    #[clap(
        long,
        env = "SYNC_TIMEOUT",
        help = "Seconds to wait for every node to reach the same height and mempool",
        default_value = "60"
    )]
    pub sync_timeout: u64,

    #[clap(
        long,
        env = "SCENARIO",
        help = "Scenario to run (absolute-fee, no-opt-in, inherited-signaling, all)",
        default_value = "all"
    )]
    pub scenario: ScenarioKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegtestConfig {
    pub bitcoin_rpc_url: String,
    pub bitcoin_rpc_user: String,
    pub bitcoin_rpc_password: String,
}

impl Default for RegtestConfig {
    fn default() -> Self {
        Self {
            bitcoin_rpc_url: "http://127.0.0.1:18443".into(),
            bitcoin_rpc_user: "rpc".into(),
            bitcoin_rpc_password: "rpc".into(),
        }
    }
}

impl Config {
    /// One [`RegtestConfig`] per configured node.
    pub fn nodes(&self) -> Vec<RegtestConfig> {
        self.bitcoin_rpc_urls
            .iter()
            .map(|url| RegtestConfig {
                bitcoin_rpc_url: url.clone(),
                bitcoin_rpc_user: self.bitcoin_rpc_user.clone(),
                bitcoin_rpc_password: self.bitcoin_rpc_password.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_list() {
        let config = Config::parse_from([
            "htlc-pinning",
            "--bitcoin-rpc-urls",
            "http://127.0.0.1:18443,http://127.0.0.1:18444,http://127.0.0.1:18445",
            "--scenario",
            "no-opt-in",
        ]);
        let nodes = config.nodes();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[1].bitcoin_rpc_url, "http://127.0.0.1:18444");
        assert_eq!(nodes[2].bitcoin_rpc_user, "rpc");
        assert_eq!(config.scenario, ScenarioKind::NoOptIn);
        assert_eq!(config.rpc_retries, 5);
        assert_eq!(config.sync_timeout, 60);
        assert_eq!(config.log_format, logging::Format::Plain);
    }
}
