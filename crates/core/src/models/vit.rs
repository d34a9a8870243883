//! Vision Transformer image classifier (ViT / DeiT) in timm's parameter layout.
//!
//! - **Embedding**: `patch_embed.proj` (conv, stride = patch) → `[B, N, D]`,
//!   prepend `cls_token` (and `dist_token` for DeiT), add `pos_embed`
//! - **Encoder**: pre-norm blocks with fused `qkv` attention and a GELU MLP
//! - **Head**: final `norm`, `head` on the CLS token; distilled models
//!   average `head` and `head_dist` (on the distillation token)
//!
//! Weight paths:
//! - `cls_token`, `dist_token`, `pos_embed`
//! - `patch_embed.proj.{weight,bias}`
//! - `blocks.{i}.{norm1,attn.qkv,attn.proj,norm2,mlp.fc1,mlp.fc2}.{weight,bias}`
//! - `norm.{weight,bias}`, `head.{weight,bias}`, `head_dist.{weight,bias}`
//!
//! Parameters live in a [`VarMap`], so the model doubles as a
//! [`ParamStore`] and can be overwritten in place from a checkpoint.

use std::collections::HashMap;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Module, Result, Tensor, Var};
use candle_nn::{
    conv2d, layer_norm, linear, ops::softmax_last_dim, Conv2d, Conv2dConfig, Init, LayerNorm,
    Linear, VarBuilder, VarMap,
};

use crate::checkpoint::{FinetuneTarget, LoadReport, ParamStore, StateDict, StateDictError};
use crate::config::VitConfig;

/// Truncated-normal stand-in used by timm for tokens and `pos_embed`.
const TOKEN_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

// ─── Building blocks ─────────────────────────────────────────────────────────

struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        Ok(Self {
            proj: conv2d(
                cfg.in_chans,
                cfg.embed_dim,
                cfg.patch_size,
                conv_cfg,
                vb.pp("proj"),
            )?,
        })
    }

    /// `[B, C, H, W]` → `[B, N, D]`.
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        self.proj
            .forward(images)?
            .flatten(2, 3)?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// Bidirectional self-attention with a fused `qkv` projection.
struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let d = cfg.embed_dim;
        let head_dim = cfg.head_dim();
        Ok(Self {
            qkv: linear(d, 3 * d, vb.pp("qkv"))?,
            proj: linear(d, d, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// `x`: `[B, S, D]` → `[B, S, D]`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _d) = x.dims3()?;
        // [B, S, 3D] → [3, B, H, S, Dh]
        let qkv = self
            .qkv
            .forward(x)?
            .reshape((b, s, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.get(0)?.contiguous()?;
        let k = qkv.get(1)?.contiguous()?;
        let v = qkv.get(2)?.contiguous()?;

        let attn = (q.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let attn = softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, s, self.num_heads * self.head_dim))?;
        self.proj.forward(&out)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.mlp_hidden_dim();
        Ok(Self {
            fc1: linear(cfg.embed_dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, cfg.embed_dim, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(x)?.gelu_erf()?)
    }
}

struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(cfg: &VitConfig, vb: VarBuilder) -> Result<Self> {
        let (d, eps) = (cfg.embed_dim, cfg.layer_norm_eps);
        Ok(Self {
            norm1: layer_norm(d, eps, vb.pp("norm1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            norm2: layer_norm(d, eps, vb.pp("norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let residual = x;
        let x = self.attn.forward(&self.norm1.forward(x)?)?;
        let x = (residual + x)?;
        let residual = &x;
        let x = self.mlp.forward(&self.norm2.forward(&x)?)?;
        residual + x
    }
}

// ─── VisionTransformer ───────────────────────────────────────────────────────

pub struct VisionTransformer {
    cfg: VitConfig,
    varmap: VarMap,
    patch_embed: PatchEmbed,
    /// `[1, 1, D]`
    cls_token: Tensor,
    /// `[1, 1, D]`, DeiT only.
    dist_token: Option<Tensor>,
    /// `[1, E + N, D]`
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    head: Linear,
    head_dist: Option<Linear>,
    device: Device,
}

impl VisionTransformer {
    /// Build a freshly initialised model on `device`.
    pub fn new(cfg: &VitConfig, device: &Device, dtype: DType) -> Result<Self> {
        if cfg.patch_size == 0 || cfg.num_heads == 0 || cfg.embed_dim % cfg.num_heads != 0 {
            candle_core::bail!(
                "invalid ViT config: embed_dim {} / num_heads {} / patch_size {}",
                cfg.embed_dim,
                cfg.num_heads,
                cfg.patch_size
            );
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let d = cfg.embed_dim;

        let cls_token = vb.get_with_hints((1, 1, d), "cls_token", TOKEN_INIT)?;
        let dist_token = if cfg.distilled {
            Some(vb.get_with_hints((1, 1, d), "dist_token", TOKEN_INIT)?)
        } else {
            None
        };
        let pos_embed = vb.get_with_hints((1, cfg.num_pos_tokens(), d), "pos_embed", TOKEN_INIT)?;
        let patch_embed = PatchEmbed::new(cfg, vb.pp("patch_embed"))?;
        let blocks = (0..cfg.depth)
            .map(|i| Block::new(cfg, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = layer_norm(d, cfg.layer_norm_eps, vb.pp("norm"))?;
        let head = linear(d, cfg.num_classes, vb.pp("head"))?;
        let head_dist = if cfg.distilled {
            Some(linear(d, cfg.num_classes, vb.pp("head_dist"))?)
        } else {
            None
        };

        Ok(Self {
            cfg: cfg.clone(),
            varmap,
            patch_embed,
            cls_token,
            dist_token,
            pos_embed,
            blocks,
            norm,
            head,
            head_dist,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.cfg
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self.vars()?.values().map(|v| v.elem_count()).sum())
    }

    fn vars(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::msg(format!("parameter map poisoned: {e}")))
    }

    /// Normalised token features, `[B, E + N, D]`.
    pub fn forward_features(&self, images: &Tensor) -> Result<Tensor> {
        let b = images.dim(0)?;
        let d = self.cfg.embed_dim;

        let patches = self.patch_embed.forward(images)?;
        let n = patches.dim(1)?;
        if n != self.cfg.num_patches() {
            candle_core::bail!(
                "expected {} patches for {}px input, got {n}",
                self.cfg.num_patches(),
                self.cfg.image_size
            );
        }

        let mut tokens = vec![self.cls_token.broadcast_as((b, 1, d))?.contiguous()?];
        if let Some(dist) = &self.dist_token {
            tokens.push(dist.broadcast_as((b, 1, d))?.contiguous()?);
        }
        tokens.push(patches);
        let mut x = Tensor::cat(&tokens, 1)?.broadcast_add(&self.pos_embed)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        self.norm.forward(&x)
    }
}

impl Module for VisionTransformer {
    /// `[B, C, H, W]` → logits `[B, num_classes]`.
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let features = self.forward_features(images)?;
        let cls = features.narrow(1, 0, 1)?.squeeze(1)?;
        let logits = self.head.forward(&cls)?;
        match &self.head_dist {
            Some(head_dist) => {
                let dist = features.narrow(1, 1, 1)?.squeeze(1)?;
                (logits + head_dist.forward(&dist)?)? / 2.0
            }
            None => Ok(logits),
        }
    }
}

impl ParamStore for VisionTransformer {
    fn state_dict(&self) -> Result<StateDict> {
        self.vars()?
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    fn load_state_dict(
        &self,
        params: &StateDict,
        strict: bool,
    ) -> std::result::Result<LoadReport, StateDictError> {
        let vars = self.vars()?;
        let mut report = LoadReport::default();
        let mut updates = Vec::new();
        for (name, var) in vars.iter() {
            match params.get(name) {
                None => report.missing_keys.push(name.clone()),
                Some(src) if src.dims() != var.dims() => report.mismatched_keys.push(name.clone()),
                Some(src) => updates.push((var, src)),
            }
        }
        report.unexpected_keys = params
            .keys()
            .filter(|k| !vars.contains_key(*k))
            .cloned()
            .collect();
        report.sort();

        let report = if strict {
            report.into_strict()?
        } else {
            report
        };
        for (var, src) in updates {
            var.set(&src.to_device(&self.device)?.to_dtype(var.dtype())?)?;
        }
        Ok(report)
    }
}

impl FinetuneTarget for VisionTransformer {
    fn num_patches(&self) -> usize {
        self.cfg.num_patches()
    }

    fn num_pos_tokens(&self) -> usize {
        self.cfg.num_pos_tokens()
    }

    fn pos_embed(&self) -> Result<Tensor> {
        Ok(self.pos_embed.clone())
    }
}
