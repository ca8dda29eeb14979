pub mod app;
pub mod cli;
pub mod config;

pub use app::Batchd;
pub use cli::Cli;
pub use config::AppConfig;
