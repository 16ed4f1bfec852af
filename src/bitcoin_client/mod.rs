pub mod client;
pub mod error;
pub mod types;

pub use client::{Client, Ledger};
pub use error::Error;
