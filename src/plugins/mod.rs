pub mod http;
pub mod local;
pub mod registry;
