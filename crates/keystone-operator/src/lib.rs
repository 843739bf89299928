pub mod cli;
pub mod config;
pub mod controllers;
pub mod core;
pub mod error;
pub mod stores;
mod init;

pub use init::start_main_loop;
