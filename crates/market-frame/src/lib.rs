pub mod frame;
pub mod series;

pub use frame::TimeFrame;
pub use series::{date_range, floor_to_step, TimeSeries};
