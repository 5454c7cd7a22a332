//! State machines driving the application.

pub mod lifecycle_sm;
