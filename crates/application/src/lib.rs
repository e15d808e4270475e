#![forbid(unsafe_code)]

pub mod expiration;
pub mod session_sync;
pub mod translator_db;
