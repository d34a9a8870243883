//! Image classifiers that can receive adapted checkpoints.

pub mod vit;

pub use vit::VisionTransformer;
