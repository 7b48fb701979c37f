pub mod snapshot;
pub mod stats;
