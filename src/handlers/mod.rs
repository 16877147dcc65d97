pub mod broadcast;
pub mod config;

pub use broadcast::*;
pub use config::*;
