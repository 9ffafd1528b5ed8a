pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::LeadflowConfig;
pub use error::{LeadflowError, Result};
pub use events::{Event, EventType};
pub use types::*;
