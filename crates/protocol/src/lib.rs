pub mod config;
pub mod control;
pub mod gateway;
pub mod packet;

pub use config::*;
pub use control::*;
pub use packet::*;
