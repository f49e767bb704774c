//! Property-based tests for fingerprinting, backoff and progress accounting

mod backoff;
