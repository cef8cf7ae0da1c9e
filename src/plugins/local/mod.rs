pub mod cache;
pub mod cli;
pub mod installer;
pub mod inventory;
