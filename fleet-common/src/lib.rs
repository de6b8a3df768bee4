pub mod config;
pub mod error;
pub mod filter;
pub mod queue;
pub mod types;
pub mod validate;

pub use error::{FleetError, FleetResult};
pub use filter::{Filter, FilterValue};
