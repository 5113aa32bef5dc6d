pub mod completion;
pub mod config;
pub mod error;
pub mod poll;
pub mod transfer;
pub mod types;
