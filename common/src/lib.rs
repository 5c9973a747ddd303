pub mod clock;
pub mod command;
pub mod config;
pub mod indicator;
pub mod scan;
pub mod schedule;
pub mod topics;
pub mod types;

pub use clock::{Clock, TimeReading};
pub use command::{decode, Command, DecodeError};
pub use config::{NetworkConfig, RuntimeConfig, ScheduleDefaults};
pub use indicator::{blink_pattern, BlinkPattern};
pub use schedule::{EngineAction, Schedule, ScheduleEngine};
pub use topics::*;
pub use types::{LinkState, OutputState};
