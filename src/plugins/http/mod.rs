pub mod cli;
pub mod client;
pub mod downloader;
pub mod manifest;
pub mod update_service;
