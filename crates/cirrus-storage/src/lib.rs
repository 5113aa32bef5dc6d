pub mod coordinator;
pub mod cos;
pub mod download_queue;
pub mod factory;
pub mod google_drive;
pub mod http;
pub mod kodo;
pub mod onedrive;
pub mod provider;
