mod tick;

pub use tick::{Cadence, FixedSchedule, FixedTimestep};
