pub mod config;
pub mod crop;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod naming;
pub mod optimizer;
pub mod resolver;
pub mod storage;
pub mod upload;
