mod settings;

pub use settings::{ConnectionConfig, ServerConfig, Settings};
