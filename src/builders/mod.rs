//! Builders to construct a scheduler client from options.

pub mod client_builder;

pub use client_builder::{build_client, build_client_from_env, DefaultClient};
