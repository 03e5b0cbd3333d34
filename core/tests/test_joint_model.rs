/// End-to-end tests for the joint masked autoencoder.
///
/// Covers output shapes, mask bookkeeping against the drawn permutations,
/// degenerate mask ratios, and the loss wiring.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crossmae_core::config::{LossNormalization, MaeConfig, ModalityConfig};
use crossmae_core::error::MaeError;
use crossmae_core::loss::forward_loss;
use crossmae_core::model::{ForwardOutput, JointModel, JointParams};
use crossmae_core::permutation::invert_permutation;
use crossmae_core::tensor::Tensor;

// ── Helpers ──────────────────────────────────────────────────────────

fn small_config(a: ModalityConfig, b: ModalityConfig) -> MaeConfig {
    MaeConfig {
        emb_dim: 8,
        encoder_layers: 1,
        encoder_heads: 2,
        decoder_layers: 1,
        decoder_heads: 2,
        mlp_ratio: 4,
        modality_a: a,
        modality_b: b,
        loss: Default::default(),
    }
}

fn raw(batch: usize, n: usize, phase: f32) -> Tensor {
    let data = (0..batch * n).map(|i| (i as f32 * 0.37 + phase).sin()).collect();
    Tensor::from_vec(data, &[batch, n]).unwrap()
}

/// Check that every sample's mask marks exactly the components the encoder dropped.
fn assert_mask_matches_indexes(out: &ForwardOutput, cfg: &MaeConfig) {
    for (mask, idx, visible, m) in [
        (&out.mask_a, &out.indexes_a, out.visible_a, &cfg.modality_a),
        (&out.mask_b, &out.indexes_b, out.visible_b, &cfg.modality_b),
    ] {
        let n = m.raw_features;
        for b in 0..idx.batch {
            let fwd = idx.forward_of(b);
            assert_eq!(invert_permutation(&fwd), idx.backward_of(b), "sample {b}: backward is not the inverse");
            let row = &mask.data[b * n..(b + 1) * n];
            for comp in 0..m.components {
                let dropped = fwd[visible..].contains(&comp);
                for k in 0..m.sub_dim {
                    let want = if dropped { 1.0 } else { 0.0 };
                    assert_eq!(row[comp * m.sub_dim + k], want, "{} sample {b} comp {comp}", m.name);
                }
            }
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn test_four_components_half_masked() {
    let cfg = small_config(
        ModalityConfig::new("rna", 4, 2, 0.5),
        ModalityConfig::new("protein", 3, 1, 0.0),
    );
    let model = JointModel::new(cfg.clone(), 0).unwrap();
    let a = Tensor::from_vec((1..=8).map(|v| v as f32).collect(), &[1, 8]).unwrap();
    let b = raw(1, 3, 0.0);

    let out = model.forward_seeded(&a, &b, 3).unwrap();
    assert_eq!(out.reconstruction_a.shape, vec![1, 1, 8]);
    assert_eq!(out.mask_a.shape, vec![1, 1, 8]);
    assert_eq!(out.visible_a, 2);
    assert_eq!(out.mask_a.data.iter().sum::<f32>(), 4.0);
    // Masked entries come in aligned pairs (one component = two features).
    for comp in 0..4 {
        assert_eq!(out.mask_a.data[2 * comp], out.mask_a.data[2 * comp + 1]);
    }
    assert!(out.mask_b.data.iter().all(|&x| x == 0.0));
    assert_mask_matches_indexes(&out, &cfg);
}

#[test]
fn test_mask_count_over_ratio_grid() {
    for &tokens in &[1usize, 2, 3, 7, 10] {
        for &ratio in &[0.0f32, 0.1, 0.25, 0.5, 0.75, 0.9] {
            let cfg = small_config(
                ModalityConfig::new("a", tokens, 2, ratio),
                ModalityConfig::new("b", 3, 1, 0.5),
            );
            let model = JointModel::new(cfg.clone(), 1).unwrap();
            let out = model.forward_seeded(&raw(3, tokens * 2, 0.1), &raw(3, 3, 0.7), 5).unwrap();

            let masked = cfg.modality_a.masked_components();
            for b in 0..3 {
                let row = &out.mask_a.data[b * tokens * 2..(b + 1) * tokens * 2];
                assert_eq!(
                    row.iter().sum::<f32>(),
                    (masked * 2) as f32,
                    "T={tokens} r={ratio} sample {b}"
                );
            }
            assert_mask_matches_indexes(&out, &cfg);
            assert!(out.reconstruction_a.data.iter().all(|x| x.is_finite()));
        }
    }
}

#[test]
fn test_shapes_at_reference_tokenization() {
    // Reference tokenization with a slim network so the test stays fast.
    let mut cfg = MaeConfig::cite_seq_reference();
    cfg.emb_dim = 8;
    cfg.encoder_layers = 1;
    cfg.decoder_layers = 1;
    let model = JointModel::new(cfg.clone(), 2).unwrap();
    let out = model.forward_seeded(&raw(2, 4000, 0.0), &raw(2, 14, 1.0), 9).unwrap();

    assert_eq!(out.visible_a, 340);
    assert_eq!(out.visible_b, 12);
    assert_eq!(out.reconstruction_a.shape, vec![2, 1, 4000]);
    assert_eq!(out.reconstruction_b.shape, vec![2, 1, 14]);
    assert_eq!(out.mask_a.data.iter().sum::<f32>(), (2 * 60 * 10) as f32);
    assert_eq!(out.mask_b.data.iter().sum::<f32>(), (2 * 2) as f32);
}

#[test]
fn test_permutations_differ_between_calls() {
    let cfg = MaeConfig::test_config();
    let model = JointModel::new(cfg.clone(), 4).unwrap();
    let a = raw(4, cfg.modality_a.raw_features, 0.0);
    let b = raw(4, cfg.modality_b.raw_features, 0.5);
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let first = model.forward(&a, &b, &mut rng).unwrap();
    let second = model.forward(&a, &b, &mut rng).unwrap();
    assert_ne!(first.indexes_a.forward, second.indexes_a.forward);
}

#[test]
fn test_everything_visible_or_nothing_visible() {
    let cfg = small_config(
        ModalityConfig::new("rna", 5, 2, 0.0),
        ModalityConfig::new("protein", 1, 2, 0.6),
    );
    let model = JointModel::new(cfg.clone(), 6).unwrap();
    let out = model.forward_seeded(&raw(2, 10, 0.0), &raw(2, 2, 0.0), 1).unwrap();

    assert_eq!(out.visible_a, 5);
    assert!(out.mask_a.data.iter().all(|&x| x == 0.0));
    assert_eq!(out.visible_b, 0);
    assert!(out.mask_b.data.iter().all(|&x| x == 1.0));
    assert!(out.reconstruction_b.data.iter().all(|x| x.is_finite()));

    let report = model.loss(&out, &raw(2, 10, 0.0), &raw(2, 2, 0.0)).unwrap();
    assert_eq!(report.loss_a, 0.0);
    assert!(report.loss_b > 0.0);
}

#[test]
fn test_full_mask_ratio_is_rejected() {
    for ratio in [1.0f32, 1.5, -0.1] {
        let cfg = small_config(
            ModalityConfig::new("rna", 4, 2, ratio),
            ModalityConfig::new("protein", 2, 1, 0.5),
        );
        let err = JointModel::new(cfg, 0).unwrap_err();
        assert!(matches!(err, MaeError::InvalidConfig(_)), "ratio {ratio}: {err}");
    }
}

#[test]
fn test_batch_and_feature_mismatch() {
    let cfg = MaeConfig::test_config();
    let model = JointModel::new(cfg.clone(), 0).unwrap();
    let a = raw(2, cfg.modality_a.raw_features, 0.0);
    let b = raw(3, cfg.modality_b.raw_features, 0.0);
    assert!(matches!(model.forward_seeded(&a, &b, 0), Err(MaeError::BatchMismatch { a: 2, b: 3 })));

    let empty = Tensor::zeros(&[0, cfg.modality_a.raw_features]);
    let empty_b = Tensor::zeros(&[0, cfg.modality_b.raw_features]);
    assert!(model.forward_seeded(&empty, &empty_b, 0).is_err());
}

#[test]
fn test_three_axis_input_is_accepted() {
    let cfg = MaeConfig::test_config();
    let model = JointModel::new(cfg.clone(), 0).unwrap();
    let flat_a = raw(2, cfg.modality_a.raw_features, 0.0);
    let flat_b = raw(2, cfg.modality_b.raw_features, 0.0);
    let a = Tensor::from_vec(flat_a.data.clone(), &[2, 1, cfg.modality_a.raw_features]).unwrap();
    let b = Tensor::from_vec(flat_b.data.clone(), &[2, 1, cfg.modality_b.raw_features]).unwrap();
    let out3 = model.forward_seeded(&a, &b, 8).unwrap();
    let out2 = model.forward_seeded(&flat_a, &flat_b, 8).unwrap();
    assert_eq!(out3.reconstruction_a, out2.reconstruction_a);
}

#[test]
fn test_decoders_see_the_other_modality() {
    // Same seed → same permutations; only modality b's input changes.
    let cfg = MaeConfig::test_config();
    let model = JointModel::new(cfg.clone(), 12).unwrap();
    let a = raw(2, cfg.modality_a.raw_features, 0.0);
    let b1 = raw(2, cfg.modality_b.raw_features, 0.0);
    let b2 = raw(2, cfg.modality_b.raw_features, 2.5);

    let o1 = model.forward_seeded(&a, &b1, 6).unwrap();
    let o2 = model.forward_seeded(&a, &b2, 6).unwrap();
    assert_eq!(o1.indexes_a, o2.indexes_a);
    assert_eq!(o1.mask_a, o2.mask_a);

    assert_ne!(o1.fused_summary_a, o2.fused_summary_a);
    assert_ne!(o1.summary_a, o2.summary_a);
    assert_ne!(o1.reconstruction_a, o2.reconstruction_a);

    // and the other direction
    let a2 = raw(2, cfg.modality_a.raw_features, 1.3);
    let o3 = model.forward_seeded(&a2, &b1, 6).unwrap();
    assert_ne!(o1.reconstruction_b, o3.reconstruction_b);
}

// ── Loss wiring ──────────────────────────────────────────────────────

#[test]
fn test_loss_ignores_visible_positions() {
    let cfg = MaeConfig::test_config();
    let model = JointModel::new(cfg.clone(), 10).unwrap();
    let a = raw(3, cfg.modality_a.raw_features, 0.0);
    let b = raw(3, cfg.modality_b.raw_features, 0.3);
    let out = model.forward_seeded(&a, &b, 2).unwrap();
    let base = model.loss(&out, &a, &b).unwrap();

    // Perturb the targets only where the mask is zero.
    let mut a_perturbed = a.clone();
    for (v, m) in a_perturbed.data.iter_mut().zip(&out.mask_a.data) {
        if *m == 0.0 {
            *v += 100.0;
        }
    }
    let perturbed = forward_loss(
        &out, &a_perturbed, &b,
        cfg.modality_a.mask_ratio, cfg.modality_b.mask_ratio, &cfg.loss,
    ).unwrap();
    assert!((base.loss_a - perturbed.loss_a).abs() < 1e-5);
    assert_eq!(base.loss_b, perturbed.loss_b);
}

#[test]
fn test_loss_normalizations_agree_on_exact_ratio() {
    // ratio 0.5 over 4 components masks exactly half, so both
    // normalizations divide by the same count.
    let mut cfg = small_config(
        ModalityConfig::new("rna", 4, 2, 0.5),
        ModalityConfig::new("protein", 2, 1, 0.5),
    );
    let a = raw(2, 8, 0.0);
    let b = raw(2, 2, 0.4);
    let model = JointModel::new(cfg.clone(), 11).unwrap();
    let out = model.forward_seeded(&a, &b, 4).unwrap();
    let nominal = model.loss(&out, &a, &b).unwrap();

    cfg.loss.normalization = LossNormalization::MaskedCount;
    let counted_model = JointModel::from_params(cfg, model.params().clone()).unwrap();
    let counted = counted_model.loss(&out, &a, &b).unwrap();
    assert!((nominal.total - counted.total).abs() < 1e-5);
}

// ── Parameters ───────────────────────────────────────────────────────

#[test]
fn test_params_json_roundtrip() {
    let cfg = MaeConfig::test_config();
    let model = JointModel::new(cfg.clone(), 21).unwrap();
    let json = serde_json::to_string(model.params()).unwrap();
    let restored: JointParams = serde_json::from_str(&json).unwrap();
    assert_eq!(&restored, model.params());

    let reloaded = JointModel::from_params(cfg.clone(), restored).unwrap();
    assert_eq!(reloaded.num_params(), model.num_params());
    let a = raw(2, cfg.modality_a.raw_features, 0.0);
    let b = raw(2, cfg.modality_b.raw_features, 0.0);
    let o1 = model.forward_seeded(&a, &b, 1).unwrap();
    let o2 = reloaded.forward_seeded(&a, &b, 1).unwrap();
    assert_eq!(o1.reconstruction_a, o2.reconstruction_a);
    assert_eq!(o1.reconstruction_b, o2.reconstruction_b);
}
