//! MQTT ingest, routing and dispatch relay.
//!
//! The binaries in `src/bin/` share this library: `mqtt-relay-ingest`
//! only exercises [`ingest`] and [`db`]; `mqtt-relay-processor` exercises
//! everything else; `mqtt-relay-reencrypt` exercises [`crypto`] and [`db`].

pub mod build_info;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod job;
pub mod model;
pub mod parser;
pub mod processor;
pub mod rules;
pub mod value;
