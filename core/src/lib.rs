pub mod error;
pub mod models;

pub use error::{BatchError, BatchResult};
pub use models::*;
