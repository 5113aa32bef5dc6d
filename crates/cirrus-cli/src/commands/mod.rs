pub mod backup;
pub mod config;
pub mod init;
pub mod progress;
pub mod providers;
pub mod restore;
pub mod select;
pub mod sign_out;
pub mod status;
