//! Shared test utilities for vit-tune-core.
//!
//! Tiny model configurations so unit and integration tests can build real
//! models in milliseconds on CPU.

mod tiny_config;

pub use tiny_config::{tiny_deit_config, tiny_vit_config, tiny_vit_config_at};
