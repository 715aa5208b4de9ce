mod custom;
mod error;
mod flows;
mod index;
mod network;
mod orchestrator;
mod paths;
mod probes;
mod reachability;
mod report;
mod state;
mod store;

pub use error::*;
pub use flows::*;
pub use index::*;
pub use orchestrator::*;
pub use paths::*;
pub use report::*;
pub use state::*;
pub use store::*;
