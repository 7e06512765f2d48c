pub mod adapter;
pub mod cancel;
pub mod compatibility;
pub mod config;
pub mod connection;
pub mod convergence;
pub mod detail;
pub mod engine;
pub mod enumerator;
pub mod error;
pub mod events;
pub mod options;
pub mod powershell;
pub mod settings;
pub mod wmi;
pub mod worker_pool;

#[cfg(test)]
pub(crate) mod testing;
