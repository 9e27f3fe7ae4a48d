#![forbid(unsafe_code)]

pub mod driver;

pub use driver::AgentDriver;
