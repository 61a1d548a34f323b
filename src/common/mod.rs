pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;

pub use error::{CertError, Result};
