pub mod auth;
pub mod config;
pub mod imap;
pub mod imf;
pub mod netio;
pub mod server;
pub mod smtp;
pub mod storage;
