pub mod defaults;
pub mod error;
pub mod ws_config;

pub use defaults::*;
pub use error::*;
pub use ws_config::*;
