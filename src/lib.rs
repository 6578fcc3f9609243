pub mod config;
pub mod context;
pub mod debug;
pub mod driver;
pub mod error;
pub mod fleet;
pub mod planner;
pub mod scheduler;
pub mod shutdown;
pub mod sim;
