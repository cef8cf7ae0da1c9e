pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fanout;
pub mod model;
pub mod ping;
pub mod planner;
pub mod sequence;
pub mod store;
pub mod tracker;
