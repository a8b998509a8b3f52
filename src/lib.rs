pub mod actions;
pub mod cli;
pub mod config;
pub mod error;
pub mod retry;
pub mod runtime;
