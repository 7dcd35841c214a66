//! RFSense backend core: embedded subject broker, scatter-gather, sample
//! ingestion into a partitioned append log, and the thin HTTP layer on top.

pub mod broker;
pub mod campaigns;
pub mod config;
pub mod gather;
pub mod health;
pub mod http;
pub mod keystore;
pub mod listener;
pub mod models;
pub mod mqtt;
pub mod nodes;
pub mod pipeline;
pub mod samples;
pub mod service;
pub mod store;
pub mod stream;
