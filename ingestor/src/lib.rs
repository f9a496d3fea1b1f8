//! Telemetry ingestion core: accepts device readings, keeps live device
//! state, streams changes to viewers and persists readings to the store,
//! buffering losslessly while the store is unreachable.

pub mod batching;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod offline_queue;
pub mod pipeline;
pub mod recovery;
pub mod rest;
pub mod stats;
pub mod store;
pub mod validate;
