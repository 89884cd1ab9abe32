//! Small helpers shared by all jobs.

mod clock;
pub use clock::{to_chrono, Clock};
