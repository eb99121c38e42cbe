//! Common test utilities for all integration tests.
//!
//! Provides shared test database setup and a seeded project fixture.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

pub mod fixtures;
pub mod test_db;
