#![forbid(unsafe_code)]

pub mod deadline;
pub mod time;
