use crate::config::VitConfig;

/// Tiny ViT at 32px with 8px patches: a 4x4 grid, 17 position tokens.
/// Uses < 100K parameters.
pub fn tiny_vit_config() -> VitConfig {
    tiny_vit_config_at(32)
}

/// [`tiny_vit_config`] at another input resolution (same 8px patches).
pub fn tiny_vit_config_at(image_size: usize) -> VitConfig {
    VitConfig {
        image_size,
        patch_size: 8,
        in_chans: 3,
        embed_dim: 32,
        depth: 2,
        num_heads: 2,
        mlp_ratio: 2.0,
        num_classes: 10,
        distilled: false,
        layer_norm_eps: 1e-6,
    }
}

/// Tiny DeiT: [`tiny_vit_config`] with a distillation token and head.
pub fn tiny_deit_config() -> VitConfig {
    VitConfig {
        distilled: true,
        ..tiny_vit_config()
    }
}
