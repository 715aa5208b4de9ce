mod command;
mod dispatcher;
mod error;
mod group;
mod minimega;
mod response;
mod retry;
mod socket;
mod substrate;

#[cfg(any(test, feature = "test-util"))]
mod fake;

pub use command::*;
pub use dispatcher::*;
pub use error::*;
pub use group::*;
pub use minimega::*;
pub use response::*;
pub use retry::*;
pub use socket::*;
pub use substrate::*;

#[cfg(any(test, feature = "test-util"))]
pub use fake::*;
