//! EngramDB: an embeddable property-graph database for agent memory.
//!
//! The engine keeps an MVCC graph in memory, logs every commit to a
//! write-ahead log and serves openCypher over Bolt and HTTP. Vector,
//! full-text and hybrid search run through the `db.index.*` procedures.

#![warn(missing_docs)]

pub mod db;
pub mod index;
pub mod logging;
pub mod primitives;
pub mod query;
pub mod server;
pub mod storage;
pub mod types;
