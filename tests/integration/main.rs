//! Integration tests for the isobridge sandbox

#[path = "../common/mod.rs"]
mod common;

mod bridge_tests;
mod module_tests;
