//! Checkpoint handling: state dicts, on-disk training checkpoints, and
//! adapting pretrained weights to a new input resolution.
//!
//! # Usage
//!
//! ```ignore
//! use vit_tune_core::checkpoint::{adapt_checkpoint, load_pretrained};
//!
//! let mut pretrained = load_pretrained("deit_base_224.safetensors")?;
//! let report = adapt_checkpoint(&mut pretrained, &model_384)?;
//! assert_eq!(report.new_grid, 24);
//! ```

mod adapter;
mod interpolate;
mod io;
mod state;

pub use adapter::{
    adapt_checkpoint, adapt_pos_embed, embed_dim, grid_side, reconcile_head, resize_patch_tokens,
    AdaptError, AdaptReport, AdaptedPosEmbed, FinetuneTarget, PosEmbedLayout, PosEmbedSplit,
    TokenGeometry, HEAD_KEYS, POS_EMBED_KEY,
};
pub use interpolate::bicubic_resize;
pub use io::{
    best_checkpoint_path, load_checkpoint, load_model, load_pretrained, read_checkpoint,
    save_checkpoint, save_weights, CheckpointError, TrainingCheckpoint,
};
pub use state::{
    strip_module_prefix, LoadReport, ParamStore, StateDict, StateDictError, Stateful,
    MODULE_PREFIX,
};
