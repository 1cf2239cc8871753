pub mod adaption_prompt;
pub mod cache;
pub mod config;
pub mod layers;
pub mod models;
pub mod modules;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
