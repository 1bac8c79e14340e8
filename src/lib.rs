//! # anno-cache
//!
//! Persistent binary cache for Java annotation-scanning results.
//!
//! ## Architecture
//!
//! - **consts** / **binary**: the framed table file format (magic, header,
//!   data, string pool, trailer)
//! - **model** / **codec**: table types and their per-version record codecs
//! - **stamp** / **container**: container fingerprints and freshness checks
//! - **lock** / **store**: per-key locking and atomic file-set replacement
//! - **cache**: the orchestrator tying stamps, tables and storage together
//! - **registry**: LMDB index of cached containers (via heed)
//! - **queue**: background cache writers
//! - **catalog** / **structure** / **scan**: source-level producer using
//!   tree-sitter over jars and directories
//! - **cli** / **config**: command line and configuration resolution

pub mod binary;
pub mod cache;
pub mod catalog;
pub mod cli;
pub mod codec;
pub mod config;
pub mod consts;
pub mod container;
pub mod error;
pub mod lock;
pub mod model;
pub mod queue;
pub mod registry;
pub mod scan;
pub mod stamp;
pub mod store;
pub mod structure;
