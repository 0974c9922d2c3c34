// Application layer - services over the ledger store

mod audit;
mod balance;
mod collaborators;
pub mod config;
mod engine;
mod error;
mod ride_funds;
mod wallet;

pub use audit::*;
pub use balance::*;
pub use collaborators::*;
pub use config::EngineConfig;
pub use engine::*;
pub use error::*;
pub use ride_funds::*;
pub use wallet::*;
