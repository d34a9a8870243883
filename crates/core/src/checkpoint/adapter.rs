//! Adapting a pretrained checkpoint to a model with a different input
//! resolution.
//!
//! A ViT trained at one image size carries a position embedding sized for its
//! own patch grid. To fine-tune at another size:
//!
//! 1. Classifier-head parameters whose shapes disagree with the target are
//!    dropped, so the target keeps its freshly initialised head.
//! 2. `pos_embed` is split into extra tokens (CLS, distillation) and patch
//!    tokens, following [`PosEmbedLayout`].
//! 3. Patch tokens are laid out on their square grid, bicubic-resized to the
//!    target grid and flattened again.
//! 4. The adapted map is loaded into the target non-strictly.
//!
//! ```text
//! pos_embed [1, E + P, D]
//!   ├── extra  [1, E, D] ────────────────────────────────┐
//!   └── patch  [1, P, D] → [1, D, √P, √P] → bicubic      │
//!                        → [1, D, √P', √P'] → [1, P', D] ┴→ cat → [1, E + P', D]
//! ```

use candle_core::{Tensor, D};
use thiserror::Error;

use super::interpolate::bicubic_resize;
use super::state::{LoadReport, ParamStore, StateDict, StateDictError};

/// Parameter holding the learned position embedding.
pub const POS_EMBED_KEY: &str = "pos_embed";

/// Classifier-head parameters reconciled against the target. `head_dist.*`
/// is left alone.
pub const HEAD_KEYS: [&str; 2] = ["head.weight", "head.bias"];

/// Errors raised while adapting a checkpoint.
#[derive(Debug, Error)]
pub enum AdaptError {
    /// A required parameter is absent from the source checkpoint.
    #[error("missing key `{0}` in source checkpoint")]
    MissingKey(String),

    /// `pos_embed` is not shaped `[1, tokens, embed_dim]`.
    #[error("pos_embed must be rank 3 [1, tokens, embed_dim], got {0:?}")]
    PosEmbedRank(Vec<usize>),

    /// Nothing is left to interpolate after removing the extra tokens.
    #[error("pos_embed has {tokens} tokens, none left for patches after {num_extra} extra tokens")]
    EmptyPatchGrid { tokens: usize, num_extra: usize },

    #[error(transparent)]
    Load(#[from] StateDictError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, AdaptError>;

/// The model a checkpoint is being adapted to.
pub trait FinetuneTarget: ParamStore {
    /// Patch tokens the model expects (a perfect square).
    fn num_patches(&self) -> usize;

    /// Total `pos_embed` tokens: extra tokens plus patches.
    fn num_pos_tokens(&self) -> usize;

    /// The model's current position embedding, `[1, num_pos_tokens, D]`.
    fn pos_embed(&self) -> candle_core::Result<Tensor>;

    /// Extra (non-patch) tokens: CLS, distillation.
    fn num_extra_tokens(&self) -> usize {
        self.num_pos_tokens().saturating_sub(self.num_patches())
    }
}

/// Token counts of the adaptation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGeometry {
    pub num_extra_tokens: usize,
    pub num_patches: usize,
}

impl TokenGeometry {
    pub fn of<T: FinetuneTarget + ?Sized>(target: &T) -> Self {
        Self {
            num_extra_tokens: target.num_extra_tokens(),
            num_patches: target.num_patches(),
        }
    }

    pub fn total(&self) -> usize {
        self.num_extra_tokens + self.num_patches
    }

    /// Side of the target patch grid.
    pub fn grid_size(&self) -> usize {
        grid_side(self.num_patches)
    }
}

/// How a checkpoint's `pos_embed` token count relates to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosEmbedLayout {
    /// Only patch tokens were saved; extra tokens come from the target.
    ExactPatchMatch,
    /// Extra tokens followed by exactly the target's patch count.
    CleanSplit,
    /// Anything else: best-effort truncation, not guaranteed correct.
    MismatchSalvage,
}

impl PosEmbedLayout {
    pub fn classify(checkpoint_tokens: usize, geometry: TokenGeometry) -> Self {
        if checkpoint_tokens == geometry.num_patches {
            Self::ExactPatchMatch
        } else if checkpoint_tokens == geometry.total() {
            Self::CleanSplit
        } else {
            Self::MismatchSalvage
        }
    }

    /// Split `checkpoint` (`[1, tokens, D]`) into extra and patch tokens.
    ///
    /// `model_pos_embed` is only read for [`PosEmbedLayout::ExactPatchMatch`].
    pub fn split(
        self,
        checkpoint: &Tensor,
        model_pos_embed: &Tensor,
        geometry: TokenGeometry,
    ) -> Result<PosEmbedSplit> {
        match self {
            Self::ExactPatchMatch => split_exact_patch_match(checkpoint, model_pos_embed, geometry),
            Self::CleanSplit => split_clean(checkpoint, geometry),
            Self::MismatchSalvage => split_salvage(checkpoint, geometry),
        }
    }
}

/// `pos_embed` separated into its two parts.
#[derive(Debug, Clone)]
pub struct PosEmbedSplit {
    /// `[1, E, D]`
    pub extra_tokens: Tensor,
    /// `[1, P, D]`
    pub patch_tokens: Tensor,
}

fn split_exact_patch_match(
    checkpoint: &Tensor,
    model_pos_embed: &Tensor,
    geometry: TokenGeometry,
) -> Result<PosEmbedSplit> {
    tracing::info!(
        num_extra_tokens = geometry.num_extra_tokens,
        "checkpoint pos_embed has no extra tokens, borrowing them from the target model"
    );
    let available = model_pos_embed.dim(1)?;
    let extra_tokens = model_pos_embed
        .narrow(1, 0, geometry.num_extra_tokens.min(available))?
        .to_device(checkpoint.device())?
        .to_dtype(checkpoint.dtype())?;
    Ok(PosEmbedSplit {
        extra_tokens,
        patch_tokens: checkpoint.clone(),
    })
}

fn split_clean(checkpoint: &Tensor, geometry: TokenGeometry) -> Result<PosEmbedSplit> {
    tracing::debug!(
        num_extra_tokens = geometry.num_extra_tokens,
        num_patches = geometry.num_patches,
        "checkpoint pos_embed splits cleanly"
    );
    Ok(PosEmbedSplit {
        extra_tokens: checkpoint.narrow(1, 0, geometry.num_extra_tokens)?,
        patch_tokens: checkpoint.narrow(1, geometry.num_extra_tokens, geometry.num_patches)?,
    })
}

fn split_salvage(checkpoint: &Tensor, geometry: TokenGeometry) -> Result<PosEmbedSplit> {
    let tokens = checkpoint.dim(1)?;
    tracing::warn!(
        checkpoint_tokens = tokens,
        expected_tokens = geometry.total(),
        "checkpoint pos_embed token count does not match the target, adjusting token selection"
    );
    let num_extra = geometry.num_extra_tokens.min(tokens);
    let num_patch = geometry.num_patches.min(tokens - num_extra);
    Ok(PosEmbedSplit {
        extra_tokens: checkpoint.narrow(1, 0, num_extra)?,
        patch_tokens: checkpoint.narrow(1, num_extra, num_patch)?,
    })
}

/// Integer square root, rounding down.
pub fn grid_side(n: usize) -> usize {
    let mut side = (n as f64).sqrt() as usize;
    while side * side > n {
        side -= 1;
    }
    while (side + 1) * (side + 1) <= n {
        side += 1;
    }
    side
}

/// Resample `[B, P, D]` patch tokens from their `√P × √P` grid to
/// `new_size × new_size`.
///
/// A non-square `P` is not rejected: only the first `⌊√P⌋²` tokens are laid
/// out on the grid.
pub fn resize_patch_tokens(patch_tokens: &Tensor, new_size: usize) -> Result<Tensor> {
    let (b, n, d) = patch_tokens.dims3()?;
    let orig_size = grid_side(n);
    if orig_size == 0 {
        return Err(AdaptError::EmptyPatchGrid {
            tokens: n,
            num_extra: 0,
        });
    }
    let grid = patch_tokens.narrow(1, 0, orig_size * orig_size)?;

    // [B, P, D] → [B, D, s, s]
    let grid = grid
        .reshape((b, orig_size, orig_size, d))?
        .permute((0, 3, 1, 2))?;
    let grid = bicubic_resize(&grid, new_size, new_size)?;
    // [B, D, s', s'] → [B, s'*s', D]
    let tokens = grid
        .permute((0, 2, 3, 1))?
        .reshape((b, new_size * new_size, d))?;
    Ok(tokens)
}

/// Result of [`adapt_pos_embed`].
#[derive(Debug, Clone)]
pub struct AdaptedPosEmbed {
    /// `[1, E + new_grid², D]`
    pub pos_embed: Tensor,
    pub layout: PosEmbedLayout,
    pub orig_grid: usize,
    pub new_grid: usize,
}

/// Resize a checkpoint position embedding to `geometry`.
pub fn adapt_pos_embed(
    checkpoint: &Tensor,
    model_pos_embed: &Tensor,
    geometry: TokenGeometry,
) -> Result<AdaptedPosEmbed> {
    let (_, tokens, _embed_dim) = checkpoint
        .dims3()
        .map_err(|_| AdaptError::PosEmbedRank(checkpoint.dims().to_vec()))?;

    let layout = PosEmbedLayout::classify(tokens, geometry);
    let split = layout.split(checkpoint, model_pos_embed, geometry)?;

    let patch_count = split.patch_tokens.dim(1)?;
    if patch_count == 0 {
        return Err(AdaptError::EmptyPatchGrid {
            tokens,
            num_extra: geometry.num_extra_tokens,
        });
    }
    let orig_grid = grid_side(patch_count);
    let new_grid = geometry.grid_size();
    if orig_grid != new_grid {
        tracing::info!(
            orig_grid,
            new_grid,
            "interpolating position embedding"
        );
    }

    let patch_tokens = resize_patch_tokens(&split.patch_tokens, new_grid)?;
    let pos_embed = Tensor::cat(&[&split.extra_tokens, &patch_tokens], 1)?;

    Ok(AdaptedPosEmbed {
        pos_embed,
        layout,
        orig_grid,
        new_grid,
    })
}

/// Drop head parameters whose shapes differ from `target_state`.
///
/// Returns the removed keys.
pub fn reconcile_head(source: &mut StateDict, target_state: &StateDict) -> Vec<String> {
    let mut removed = Vec::new();
    for key in HEAD_KEYS {
        let mismatched = match (source.get(key), target_state.get(key)) {
            (Some(src), Some(dst)) => src.dims() != dst.dims(),
            _ => false,
        };
        if mismatched {
            tracing::info!(key, "removing key from pretrained checkpoint");
            source.remove(key);
            removed.push(key.to_string());
        }
    }
    removed
}

/// What [`adapt_checkpoint`] did.
#[derive(Debug, Clone)]
pub struct AdaptReport {
    pub removed_head_keys: Vec<String>,
    pub layout: PosEmbedLayout,
    pub orig_grid: usize,
    pub new_grid: usize,
    /// `[1, tokens, D]` of the adapted embedding.
    pub pos_embed_dims: Vec<usize>,
    pub load: LoadReport,
}

/// Adapt `source` in place and load it into `target` non-strictly.
///
/// Head keys with mismatched shapes are removed from `source` and its
/// `pos_embed` is overwritten with the resized embedding. Fails only if
/// `pos_embed` is missing or cannot be reshaped.
pub fn adapt_checkpoint<T: FinetuneTarget + ?Sized>(
    source: &mut StateDict,
    target: &T,
) -> Result<AdaptReport> {
    let target_state = target.state_dict()?;
    let removed_head_keys = reconcile_head(source, &target_state);

    let checkpoint_pos = source
        .get(POS_EMBED_KEY)
        .cloned()
        .ok_or_else(|| AdaptError::MissingKey(POS_EMBED_KEY.to_string()))?;
    let geometry = TokenGeometry::of(target);
    let adapted = adapt_pos_embed(&checkpoint_pos, &target.pos_embed()?, geometry)?;
    let pos_embed_dims = adapted.pos_embed.dims().to_vec();
    source.insert(POS_EMBED_KEY.to_string(), adapted.pos_embed);

    let load = target.load_state_dict(source, false)?;
    for key in &load.mismatched_keys {
        tracing::warn!(key = key.as_str(), "shape mismatch, keeping target initialisation");
    }
    tracing::info!(
        layout = ?adapted.layout,
        missing = load.missing_keys.len(),
        unexpected = load.unexpected_keys.len(),
        "pretrained checkpoint loaded into target"
    );

    Ok(AdaptReport {
        removed_head_keys,
        layout: adapted.layout,
        orig_grid: adapted.orig_grid,
        new_grid: adapted.new_grid,
        pos_embed_dims,
        load,
    })
}

/// Embedding width of a `pos_embed` tensor.
pub fn embed_dim(pos_embed: &Tensor) -> candle_core::Result<usize> {
    pos_embed.dim(D::Minus1)
}
