// src/lib.rs

//! Buildhub ingestion library
//!
//! Turns archive listings and S3 inventories into canonical release records and
//! publishes the changed ones to a remote record store.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
