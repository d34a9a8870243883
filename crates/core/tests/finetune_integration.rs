//! Integration tests for adapting pretrained ViT weights to a new
//! fine-tuning setup: resolution change, new label set, distilled sources,
//! and checkpoints read back from disk.
//!
//! Models use the real ViT token geometry (16px patches at 224/384px) with a
//! narrow embedding so everything runs on CPU in well under a second.

use candle_core::{DType, Device, Module, Tensor};
use vit_tune_core::checkpoint::{
    adapt_checkpoint, load_checkpoint, load_pretrained, save_checkpoint, save_weights, AdaptError,
    ParamStore, PosEmbedLayout, StateDict, Stateful, TrainingCheckpoint, MODULE_PREFIX,
    POS_EMBED_KEY,
};
use vit_tune_core::{VisionTransformer, VitConfig};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn narrow_vit(image_size: usize, num_classes: usize, distilled: bool) -> VitConfig {
    VitConfig {
        image_size,
        patch_size: 16,
        in_chans: 3,
        embed_dim: 32,
        depth: 1,
        num_heads: 2,
        mlp_ratio: 2.0,
        num_classes,
        distilled,
        layer_norm_eps: 1e-6,
    }
}

fn build(cfg: &VitConfig) -> VisionTransformer {
    VisionTransformer::new(cfg, &Device::Cpu, DType::F32).expect("model construction failed")
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Stateless stand-in for optimizer, scheduler and scaler.
#[derive(Default)]
struct Empty;

impl Stateful for Empty {
    fn state_dict(&self) -> candle_core::Result<StateDict> {
        Ok(StateDict::new())
    }

    fn load_state_dict(&mut self, _state: &StateDict) -> candle_core::Result<()> {
        Ok(())
    }
}

// ─── Same geometry ───────────────────────────────────────────────────────────

#[test]
fn same_geometry_is_identity() {
    let cfg = narrow_vit(224, 10, false);
    let source = build(&cfg);
    let target = build(&cfg);

    let mut pretrained = source.state_dict().unwrap();
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();

    assert_eq!(report.layout, PosEmbedLayout::CleanSplit);
    assert_eq!((report.orig_grid, report.new_grid), (14, 14));
    assert_eq!(report.pos_embed_dims, vec![1, 197, 32]);
    assert!(report.removed_head_keys.is_empty());
    assert!(report.load.is_clean());

    let after = target.state_dict().unwrap();
    let before = source.state_dict().unwrap();
    assert_eq!(
        max_abs_diff(&before[POS_EMBED_KEY], &after[POS_EMBED_KEY]),
        0.0
    );

    let images = Tensor::randn(0f32, 1.0, (2, 3, 224, 224), &Device::Cpu).unwrap();
    let diff = max_abs_diff(
        &source.forward(&images).unwrap(),
        &target.forward(&images).unwrap(),
    );
    assert!(diff < 1e-5, "logits differ by {diff}");
}

// ─── Resolution and label-set change ─────────────────────────────────────────

#[test]
fn upscale_224_to_384_with_new_head() {
    let source = build(&narrow_vit(224, 1000, false));
    let target = build(&narrow_vit(384, 100, false));
    let target_head = target.state_dict().unwrap()["head.weight"].clone();

    let mut pretrained = source.state_dict().unwrap();
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();

    // 197 tokens is neither 576 nor 1 + 576.
    assert_eq!(report.layout, PosEmbedLayout::MismatchSalvage);
    assert_eq!((report.orig_grid, report.new_grid), (14, 24));
    assert_eq!(report.pos_embed_dims, vec![1, 577, 32]);
    assert_eq!(report.removed_head_keys, vec!["head.weight", "head.bias"]);
    assert!(!pretrained.contains_key("head.weight"));
    assert_eq!(report.load.missing_keys, vec!["head.bias", "head.weight"]);
    assert!(report.load.mismatched_keys.is_empty());

    let after = target.state_dict().unwrap();
    // Head keeps its fresh initialisation.
    assert_eq!(max_abs_diff(&target_head, &after["head.weight"]), 0.0);
    // CLS position is carried over untouched.
    let src_cls = source.state_dict().unwrap()[POS_EMBED_KEY]
        .narrow(1, 0, 1)
        .unwrap();
    let dst_cls = after[POS_EMBED_KEY].narrow(1, 0, 1).unwrap();
    assert_eq!(max_abs_diff(&src_cls, &dst_cls), 0.0);
    // Encoder weights are copied.
    let key = "blocks.0.attn.qkv.weight";
    assert_eq!(
        max_abs_diff(&source.state_dict().unwrap()[key], &after[key]),
        0.0
    );

    let images = Tensor::randn(0f32, 1.0, (1, 3, 384, 384), &Device::Cpu).unwrap();
    assert_eq!(target.forward(&images).unwrap().dims(), &[1, 100]);
}

#[test]
fn larger_source_grid_is_truncated_not_resampled() {
    let source = build(&narrow_vit(384, 10, false));
    let target = build(&narrow_vit(224, 10, false));
    let source_pos = source.state_dict().unwrap()[POS_EMBED_KEY].clone();

    let mut pretrained = source.state_dict().unwrap();
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();

    // Salvage keeps CLS and the first 196 of 576 patch tokens.
    assert_eq!(report.layout, PosEmbedLayout::MismatchSalvage);
    assert_eq!((report.orig_grid, report.new_grid), (14, 14));
    assert_eq!(report.pos_embed_dims, vec![1, 197, 32]);
    assert!(report.load.is_clean());

    let after = target.state_dict().unwrap()[POS_EMBED_KEY].clone();
    assert_eq!(
        max_abs_diff(&source_pos.narrow(1, 0, 197).unwrap(), &after),
        0.0
    );
}

// ─── Token layouts ───────────────────────────────────────────────────────────

#[test]
fn patch_only_checkpoint_borrows_target_cls() {
    let target = build(&narrow_vit(384, 10, false));

    let mut pretrained = build(&narrow_vit(224, 10, false)).state_dict().unwrap();
    let patches_only = pretrained[POS_EMBED_KEY].narrow(1, 1, 196).unwrap();
    pretrained.insert(POS_EMBED_KEY.to_string(), patches_only);

    // 196 tokens against a 576-patch target is not an exact match, so this
    // goes through salvage with the first token treated as CLS.
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();
    assert_eq!(report.layout, PosEmbedLayout::MismatchSalvage);
    assert_eq!(report.pos_embed_dims, vec![1, 577, 32]);

    // A patch-only embedding for the exact target grid keeps the target CLS.
    let target_pos = target.state_dict().unwrap()[POS_EMBED_KEY].clone();
    let mut exact = target.state_dict().unwrap();
    let patch_tokens = (exact[POS_EMBED_KEY].narrow(1, 1, 576).unwrap() * 2.0).unwrap();
    exact.insert(POS_EMBED_KEY.to_string(), patch_tokens);
    let report = adapt_checkpoint(&mut exact, &target).unwrap();
    assert_eq!(report.layout, PosEmbedLayout::ExactPatchMatch);
    assert_eq!((report.orig_grid, report.new_grid), (24, 24));

    let after = target.state_dict().unwrap()[POS_EMBED_KEY].clone();
    assert_eq!(
        max_abs_diff(
            &target_pos.narrow(1, 0, 1).unwrap(),
            &after.narrow(1, 0, 1).unwrap()
        ),
        0.0
    );
}

#[test]
fn distilled_source_into_plain_target_is_salvaged() {
    let source = build(&narrow_vit(224, 1000, true));
    let target = build(&narrow_vit(384, 1000, false));

    let mut pretrained = source.state_dict().unwrap();
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();

    // 198 tokens vs. 1 + 576: salvage keeps 1 extra and the first 14² patches.
    assert_eq!(report.layout, PosEmbedLayout::MismatchSalvage);
    assert_eq!((report.orig_grid, report.new_grid), (14, 24));
    assert_eq!(report.pos_embed_dims, vec![1, 577, 32]);
    assert!(report.removed_head_keys.is_empty());
    assert_eq!(
        report.load.unexpected_keys,
        vec!["dist_token", "head_dist.bias", "head_dist.weight"]
    );
}

#[test]
fn distilled_to_distilled_upscale() {
    let source = build(&narrow_vit(224, 10, true));
    let target = build(&narrow_vit(384, 10, true));

    let mut pretrained = source.state_dict().unwrap();
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();
    // 2 + 196 tokens against 2 + 576: both extra tokens survive the salvage.
    assert_eq!(report.layout, PosEmbedLayout::MismatchSalvage);
    assert_eq!((report.orig_grid, report.new_grid), (14, 24));
    assert_eq!(report.pos_embed_dims, vec![1, 578, 32]);
    assert!(report.load.is_clean());
}

#[test]
fn missing_pos_embed_is_an_error() {
    let target = build(&narrow_vit(224, 10, false));
    let mut pretrained = build(&narrow_vit(224, 10, false)).state_dict().unwrap();
    pretrained.remove(POS_EMBED_KEY);

    let err = adapt_checkpoint(&mut pretrained, &target).unwrap_err();
    assert!(matches!(err, AdaptError::MissingKey(ref k) if k == POS_EMBED_KEY));
}

// ─── From disk ───────────────────────────────────────────────────────────────

#[test]
fn data_parallel_weights_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pretrained.safetensors");

    let source = build(&narrow_vit(224, 1000, false));
    let wrapped: StateDict = source
        .state_dict()
        .unwrap()
        .into_iter()
        .map(|(k, v)| (format!("{MODULE_PREFIX}{k}"), v))
        .collect();
    save_weights(&wrapped, &path).unwrap();

    let mut pretrained = load_pretrained(&path).unwrap();
    assert!(pretrained.keys().all(|k| !k.starts_with(MODULE_PREFIX)));

    let target = build(&narrow_vit(384, 37, false));
    let report = adapt_checkpoint(&mut pretrained, &target).unwrap();
    assert_eq!(report.pos_embed_dims, vec![1, 577, 32]);
    assert_eq!(report.removed_head_keys.len(), 2);
}

#[test]
fn training_checkpoint_resumes_adapted_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run/ckpt.safetensors");

    let cfg = narrow_vit(384, 10, false);
    let model = build(&cfg);
    let mut pretrained = build(&narrow_vit(224, 10, false)).state_dict().unwrap();
    adapt_checkpoint(&mut pretrained, &model).unwrap();

    let ckpt = TrainingCheckpoint::capture(7, &model, &Empty, &Empty, &Empty).unwrap();
    let best = save_checkpoint(&ckpt, true, &path).unwrap();
    assert!(best.expect("best copy path").exists());

    let resumed = build(&cfg);
    let (mut opt, mut sched, mut scaler) = (Empty, Empty, Empty);
    let epoch = load_checkpoint(&resumed, &mut opt, &mut sched, &mut scaler, &path).unwrap();
    assert_eq!(epoch, 7);

    let images = Tensor::randn(0f32, 1.0, (1, 3, 384, 384), &Device::Cpu).unwrap();
    let diff = max_abs_diff(
        &model.forward(&images).unwrap(),
        &resumed.forward(&images).unwrap(),
    );
    assert!(diff < 1e-5, "logits differ by {diff}");
}
