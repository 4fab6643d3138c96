//! Integration tests for svcrig
//!
//! These tests run the actual binary against the local transport, using a
//! small shell script as the managed service.

mod config;
mod logs;
mod support;
