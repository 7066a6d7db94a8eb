pub mod config;
pub mod logging;
pub mod log_buffer;

pub use config::Config;
pub use log_buffer::LogBuffer;
