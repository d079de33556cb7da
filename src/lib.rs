pub mod app;
pub mod apply;
pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod crypto;
pub mod error;
pub mod host;
pub mod kv;
pub mod observability;
pub mod policy;
pub mod recovery;
pub mod signer;
pub mod storage;
pub mod telemetry;
pub mod trust;
pub mod verifier;
