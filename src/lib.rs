pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod shutdown;
pub mod worker;

pub use error::{HiveError, Result};
