pub mod assembler;
pub mod bitcoin_client;
pub mod budget;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod retry;
pub mod scenario;
pub mod script;
pub mod signer;
pub mod stopper;
pub mod test_utils;
