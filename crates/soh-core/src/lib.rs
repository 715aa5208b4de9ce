mod config;
mod error;
mod experiment;
mod extract;
mod os;

pub use config::*;
pub use error::*;
pub use experiment::*;
pub use os::*;
