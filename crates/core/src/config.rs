use serde::{Deserialize, Serialize};

/// Vision Transformer hyperparameters (timm / DeiT naming).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VitConfig {
    pub image_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub num_classes: usize,
    /// DeiT distillation: adds a `dist_token` and a `head_dist` classifier.
    pub distilled: bool,
    pub layer_norm_eps: f64,
}

impl VitConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Side length of the square patch grid.
    pub fn grid_size(&self) -> usize {
        self.image_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size() * self.grid_size()
    }

    /// CLS token, plus the distillation token when `distilled`.
    pub fn num_extra_tokens(&self) -> usize {
        if self.distilled {
            2
        } else {
            1
        }
    }

    /// Length of the `pos_embed` token axis.
    pub fn num_pos_tokens(&self) -> usize {
        self.num_extra_tokens() + self.num_patches()
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    pub fn mlp_hidden_dim(&self) -> usize {
        (self.embed_dim as f64 * self.mlp_ratio) as usize
    }
}

impl Default for VitConfig {
    /// ViT-Base/16 at 224px.
    fn default() -> Self {
        Self {
            image_size: 224,
            patch_size: 16,
            in_chans: 3,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4.0,
            num_classes: 1000,
            distilled: false,
            layer_norm_eps: 1e-6,
        }
    }
}
