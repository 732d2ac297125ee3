pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use clock::{ManualClock, SystemClock};
pub use config::FlowConfig;
pub use error::{FlowError, Result};
pub use event::EventBus;
pub use traits::Clock;
pub use types::*;
