pub mod collector;
pub mod log_record;
pub mod message;
pub mod peers;
pub mod qc;
pub mod store;

pub use collector::*;
pub use log_record::*;
pub use message::*;
pub use peers::*;
pub use qc::*;
pub use store::*;
