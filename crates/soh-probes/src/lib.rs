mod error;
mod meta;
mod protocol;
mod strategy;

pub use error::*;
pub use meta::*;
pub use protocol::*;
pub use strategy::*;
