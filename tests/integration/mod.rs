//! Integration tests for Quarry.

pub mod engine_test;
pub mod execution_test;
pub mod materialize_test;
pub mod template_test;
