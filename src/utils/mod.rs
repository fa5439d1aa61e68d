pub mod clock;
pub mod config;
pub mod log_buffer;
pub mod logging;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
