pub mod api;
pub mod backup;
pub mod connection;
pub mod error;
pub mod overlay;
pub mod shares;
pub mod storage;
pub mod utils;
pub mod web;

pub use error::{Error, ErrorKind, Result};
