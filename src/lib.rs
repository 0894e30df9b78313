pub mod cli;
pub mod error;

pub use error::{KubescrapeError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
