mod config;
mod error;
mod transaction;
mod types;

pub use config::*;
pub use error::*;
pub use transaction::*;
pub use types::*;
