// Library exports for the analysis supervisor

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod ipc;
pub mod logs;
pub mod process;
pub mod service;
pub mod state;
