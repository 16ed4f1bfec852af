use bitcoin::Amount;
use thiserror::Error as ThisError;

/// Failures while building scripts and unsigned transactions.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),
    #[error("Output of {value} is below the dust floor of {floor}")]
    Dust { value: Amount, floor: Amount },
    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("Transaction has no inputs")]
    NoInputs,
    #[error("Coins exhausted: {needed} needed, {available} available")]
    CoinsExhausted { needed: usize, available: usize },
    #[error("Value overflow while summing amounts")]
    ValueOverflow,
    #[error("Transaction has {inputs} inputs but {witnesses} witnesses")]
    WitnessCount { inputs: usize, witnesses: usize },
    #[error("Filler plan of {weight} WU does not fit one block of standard transactions")]
    InvalidFillPlan { weight: u64 },
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Digest must be 32 bytes, got {0}")]
    InvalidDigestLength(usize),
    #[error("Script {script} has no {branch} branch")]
    UnsupportedBranch {
        script: &'static str,
        branch: &'static str,
    },
    #[error("Branch {branch} expects {expected} signatures, got {got}")]
    SignatureCount {
        branch: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Input index {index} out of range for {inputs} inputs")]
    InputIndex { index: usize, inputs: usize },
    #[error("Signature hash failed: {0}")]
    Sighash(String),
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("Preimage does not hash to the channel hash lock")]
    PreimageMismatch,
    #[error("Transaction {0} has no output to spend")]
    MissingOutput(bitcoin::Txid),
}
