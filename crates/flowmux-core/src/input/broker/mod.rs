//! Input-side brokers composing multiple producing layers into one.

mod dynamic;
mod fan_in;

pub use dynamic::{DynamicFanIn, InputBuilder};
pub use fan_in::FanIn;
