//! copyline: staged marketing-copy generation
//!
//! Turns a product description into a set of copy sections (description, USPs, chapters,
//! FAQ, and more) by running dependent stages through a worker, with a tiered result
//! cache, batch recovery for failed stages, and an ordered progress stream.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod stage;
pub mod types;
