use bitcoin::Txid;
use thiserror::Error as ThisError;

use crate::{
    bitcoin_client,
    error::{ChannelError, ConstructionError, SignatureError},
};

use super::pinning::PinningState;

#[derive(ThisError, Debug)]
pub enum ScenarioError {
    #[error("Construction failed: {0}")]
    Construction(#[from] ConstructionError),
    #[error("Signing failed: {0}")]
    Signature(#[from] SignatureError),
    #[error("Channel update failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("Assertion failed at step {step}: {detail}")]
    AssertionFailed { step: usize, detail: String },
    #[error("Transaction {txid} rejected: {reason}")]
    UnexpectedRejection { txid: Txid, reason: String },
    #[error("Ledger call {action} failed: {source}")]
    Infrastructure {
        action: String,
        #[source]
        source: bitcoin_client::Error,
    },
    #[error("Nodes did not converge: {0}")]
    Diverged(String),
    #[error("Scenario cancelled")]
    Cancelled,
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: PinningState, to: PinningState },
    #[error("Node {node} does not exist, {nodes} configured")]
    UnknownNode { node: usize, nodes: usize },
}

impl ScenarioError {
    pub fn infrastructure(action: impl Into<String>, source: bitcoin_client::Error) -> Self {
        ScenarioError::Infrastructure {
            action: action.into(),
            source,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ScenarioError::Infrastructure { source, .. } if source.is_transient())
    }
}
