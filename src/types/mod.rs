//! Shared type definitions
//!
//! This module contains the core domain types used across the crate.

pub mod message;
pub mod model;
pub mod sampling;

pub use message::{Message, Role};
pub use model::{ModelDescriptor, ModelStatus, ResourceHints};
pub use sampling::SamplingConfig;
