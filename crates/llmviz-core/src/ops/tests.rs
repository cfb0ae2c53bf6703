use approx::assert_abs_diff_eq;

use super::*;
use crate::activations::gelu_tanh;
use crate::kernel::{evaluate_grid, CellKernel, KernelFault, KernelInputs, SourceView};
use crate::tensor::TensorView;

/// Host-side stand-in for a device buffer.
#[derive(Debug)]
struct Grid {
    data: Vec<f32>,
    width: usize,
    height: usize,
    channels: usize,
}

impl Grid {
    fn new(width: usize, height: usize, channels: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height * channels);
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    fn at(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width + x) * self.channels + c]
    }
}

fn run(
    kernel: &dyn CellKernel,
    sources: &[&Grid],
    uniforms: &[i32],
    width: usize,
    height: usize,
    channels: usize,
) -> Result<Grid, KernelFault> {
    let views = sources
        .iter()
        .map(|g| SourceView::new(&g.data, g.width, g.height, g.channels))
        .collect();
    let inputs = KernelInputs::new(views, uniforms);
    let mut outputs = vec![vec![f32::NAN; width * height * channels]];
    evaluate_grid(kernel, &inputs, width, &[channels], &mut outputs)?;
    Ok(Grid::new(width, height, channels, outputs.remove(0)))
}

/// Deterministic pseudo-random values in roughly [-2, 2].
fn wobble(n: usize, seed: u32) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let v = (i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed * 97) % 1000;
            (v as f32 / 250.0) - 2.0
        })
        .collect()
}

#[test]
fn test_embed_lookup() {
    let table = Grid::new(3, 2, 1, vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0]);
    let idx = Grid::new(1, 3, 1, vec![1.0, 0.0, 1.0]);
    let out = run(&Embed { n_rows: 2 }, &[&idx, &table], &[], 3, 3, 1).unwrap();
    assert_eq!(
        out.data,
        vec![10.0, 20.0, 30.0, 1.0, 2.0, 3.0, 10.0, 20.0, 30.0]
    );
}

#[test]
fn test_embed_index_out_of_range() {
    let table = Grid::new(2, 2, 1, vec![0.0; 4]);
    let idx = Grid::new(1, 1, 1, vec![2.0]);
    let err = run(&Embed { n_rows: 2 }, &[&idx, &table], &[], 2, 1, 1).unwrap_err();
    assert!(matches!(err, KernelFault::IndexOutOfRange { rows: 2, .. }));

    let idx = Grid::new(1, 1, 1, vec![-1.0]);
    assert!(run(&Embed { n_rows: 2 }, &[&idx, &table], &[], 2, 1, 1).is_err());
}

#[test]
fn test_add() {
    let a = Grid::new(2, 2, 1, vec![1.0, 2.0, 3.0, 4.0]);
    let b = Grid::new(2, 2, 1, vec![0.5, 0.5, -3.0, 1.0]);
    let out = run(&Add, &[&a, &b], &[], 2, 2, 1).unwrap();
    assert_eq!(out.data, vec![1.5, 2.5, 0.0, 5.0]);
}

#[test]
fn test_layer_norm_normalizes_rows() {
    let (c, rows) = (48, 5);
    let input = Grid::new(c, rows, 1, wobble(c * rows, 3).iter().map(|v| v * 3.0 + 1.0).collect());
    let agg = run(&NormAgg { n: c, eps: 1e-5 }, &[&input], &[], 1, rows, 2).unwrap();

    let ones = Grid::new(1, c, 1, vec![1.0; c]);
    let zeros = Grid::new(1, c, 1, vec![0.0; c]);
    let out = run(&NormApply, &[&input, &agg, &ones, &zeros], &[], c, rows, 1).unwrap();

    for y in 0..rows {
        let row: Vec<f32> = (0..c).map(|x| out.at(x, y, 0)).collect();
        let mean = row.iter().sum::<f32>() / c as f32;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / c as f32;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
    }
}

#[test]
fn test_layer_norm_applies_scale_and_shift() {
    let input = Grid::new(2, 1, 1, vec![1.0, 3.0]);
    let agg = run(&NormAgg { n: 2, eps: 0.0 }, &[&input], &[], 1, 1, 2).unwrap();
    assert_abs_diff_eq!(agg.at(0, 0, 0), 2.0);
    assert_abs_diff_eq!(agg.at(0, 0, 1), 1.0);

    let weight = Grid::new(1, 2, 1, vec![2.0, 3.0]);
    let bias = Grid::new(1, 2, 1, vec![0.5, -0.5]);
    let out = run(&NormApply, &[&input, &agg, &weight, &bias], &[], 2, 1, 1).unwrap();
    assert_eq!(out.data, vec![-1.5, 2.5]);
}

#[test]
fn test_linear_with_and_without_bias() {
    // two rows of three inputs, two outputs
    let input = Grid::new(3, 2, 1, vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0]);
    let weight = Grid::new(3, 2, 1, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    let bias = Grid::new(1, 2, 1, vec![0.5, -1.0]);

    let out = run(
        &Linear { n_in: 3, bias: true },
        &[&input, &weight, &bias],
        &[],
        2,
        2,
        1,
    )
    .unwrap();
    assert_eq!(out.data, vec![1.5, 5.0, -0.5, -1.0]);

    let out = run(&Linear { n_in: 3, bias: false }, &[&input, &weight], &[], 2, 2, 1).unwrap();
    assert_eq!(out.data, vec![1.0, 6.0, -1.0, 0.0]);
}

#[test]
fn test_qkv_packs_heads_and_channels() {
    let (b, t, h, a) = (2, 2, 2, 2);
    let c = h * a;
    let input = Grid::new(c, b * t, 1, wobble(c * b * t, 1));
    let w = TensorView::new(vec![3 * c, c], wobble(3 * c * c, 2)).unwrap();
    let bias = TensorView::new(vec![3 * c], wobble(3 * c, 5)).unwrap();

    let staged_w = w.view(&[3, h, a, c]).unwrap().permute(&[1, 2, 3, 0]).unwrap();
    let staged_b = bias.view(&[3, h, a]).unwrap().permute(&[1, 2, 0]).unwrap();
    let w_grid = Grid::new(c, h * a, 3, staged_w.to_dense_vec());
    let b_grid = Grid::new(1, h * a, 3, staged_b.to_dense_vec());

    let kernel = Qkv {
        t,
        n_head: h,
        head_size: a,
        n_embd: c,
    };
    let out = run(&kernel, &[&input, &w_grid, &b_grid], &[], a, b * h * t, 3).unwrap();

    for bi in 0..b {
        for hi in 0..h {
            for ti in 0..t {
                for ai in 0..a {
                    for k in 0..3 {
                        let row = k * c + hi * a + ai;
                        let mut expected = bias.get(&[row]).unwrap();
                        for i in 0..c {
                            expected += input.at(i, bi * t + ti, 0) * w.get(&[row, i]).unwrap();
                        }
                        let y = (bi * h + hi) * t + ti;
                        assert_abs_diff_eq!(out.at(ai, y, k), expected, epsilon = 1e-5);
                    }
                }
            }
        }
    }
}

fn qkv_grid(rows: usize, a: usize, seed: u32) -> Grid {
    Grid::new(a, rows, 3, wobble(a * rows * 3, seed))
}

#[test]
fn test_self_attend_is_causal_and_scaled() {
    let (t, a) = (4, 3);
    let qkv = qkv_grid(2 * t, a, 7);
    let out = run(&SelfAttend { t, head_size: a }, &[&qkv], &[], t, 2 * t, 1).unwrap();

    for y in 0..2 * t {
        let q = y % t;
        let base = y - q;
        for k in 0..t {
            if k > q {
                assert_eq!(out.at(k, y, 0), 0.0);
                continue;
            }
            let dot: f32 = (0..a).map(|i| qkv.at(i, y, 0) * qkv.at(i, base + k, 1)).sum();
            assert_abs_diff_eq!(out.at(k, y, 0), dot / (a as f32).sqrt(), epsilon = 1e-6);
        }
    }
}

#[test]
fn test_attention_softmax_is_causal_and_normalized() {
    let t = 6;
    let rows = 3 * t;
    let mut scores = wobble(t * rows, 11);
    for y in 0..rows {
        for k in (y % t + 1)..t {
            scores[y * t + k] = 0.0;
        }
    }
    let scores = Grid::new(t, rows, 1, scores.iter().map(|v| v * 4.0).collect());

    let agg = run(&AttnAgg { t }, &[&scores], &[], 1, rows, 2).unwrap();
    let sm = run(&AttnSoftmax { t }, &[&scores, &agg], &[], t, rows, 1).unwrap();

    for y in 0..rows {
        let q = y % t;
        let sum: f32 = (0..=q).map(|k| sm.at(k, y, 0)).sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
        for k in (q + 1)..t {
            assert_eq!(sm.at(k, y, 0), 0.0, "row {y} col {k}");
        }
    }
    // The first row of each sequence attends only to itself.
    assert_abs_diff_eq!(sm.at(0, 0, 0), 1.0, epsilon = 1e-6);
}

#[test]
fn test_attention_agg_ignores_masked_scores() {
    // Row q = 0 only sees its own score even if later cells hold garbage.
    let scores = Grid::new(2, 2, 1, vec![-5.0, 100.0, -5.0, 1.0]);
    let agg = run(&AttnAgg { t: 2 }, &[&scores], &[], 1, 2, 2).unwrap();
    assert_eq!(agg.at(0, 0, 1), -5.0);
    assert_abs_diff_eq!(agg.at(0, 0, 0), 1.0);
    assert_eq!(agg.at(0, 1, 1), 1.0);
}

#[test]
fn test_scaled_vectors_sum_weighted_values() {
    let (t, h, a) = (3, 2, 2);
    let qkv = qkv_grid(h * t, a, 13);
    let mut weights = vec![0.0; t * h * t];
    for y in 0..h * t {
        let q = y % t;
        for k in 0..=q {
            weights[y * t + k] = 1.0 / (q + 1) as f32;
        }
    }
    let sm = Grid::new(t, h * t, 1, weights);

    let kernel = ScaledVectors {
        t,
        n_head: h,
        head_size: a,
    };
    let out = run(&kernel, &[&qkv, &sm], &[], h * a, t, 1).unwrap();

    for q in 0..t {
        for hi in 0..h {
            for ai in 0..a {
                let mean: f32 = (0..=q).map(|k| qkv.at(ai, hi * t + k, 2)).sum::<f32>()
                    / (q + 1) as f32;
                assert_abs_diff_eq!(out.at(hi * a + ai, q, 0), mean, epsilon = 1e-6);
            }
        }
    }
}

#[test]
fn test_gelu_kernel_matches_closed_form() {
    let xs: Vec<f32> = (-600..=600).map(|i| i as f32 / 100.0).collect();
    let n = xs.len();
    let input = Grid::new(n, 1, 1, xs.clone());
    let out = run(&Gelu, &[&input], &[], n, 1, 1).unwrap();
    for (x, y) in xs.iter().zip(&out.data) {
        let x64 = f64::from(*x);
        let expected = 0.5
            * x64
            * (1.0 + ((2.0 / std::f64::consts::PI).sqrt() * (x64 + 0.044715 * x64.powi(3))).tanh());
        assert!((f64::from(*y) - expected).abs() <= 1e-6, "x = {x}");
        assert_eq!(*y, gelu_tanh(*x));
    }
}

#[test]
fn test_full_softmax_rows() {
    let (v, rows) = (5, 4);
    let logits = Grid::new(v, rows, 1, wobble(v * rows, 17).iter().map(|x| x * 10.0).collect());
    let agg = run(&SoftmaxAgg { n: v }, &[&logits], &[], 1, rows, 2).unwrap();
    let probs = run(&Softmax, &[&logits, &agg], &[], v, rows, 1).unwrap();

    for y in 0..rows {
        let row: Vec<f32> = (0..v).map(|x| logits.at(x, y, 0)).collect();
        let mut expected = row.clone();
        crate::activations::softmax_in_place(&mut expected);
        for x in 0..v {
            assert_abs_diff_eq!(probs.at(x, y, 0), expected[x], epsilon = 1e-6);
        }
        let sum: f32 = (0..v).map(|x| probs.at(x, y, 0)).sum();
        assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-5);
    }
}

#[test]
fn test_argmax_copy_writes_target_only() {
    let (t, v) = (4, 3);
    // two sequences; predictions favour token 2 at t=1 (batch 0) and token 0 at t=1 (batch 1)
    let probs = Grid::new(
        v,
        2 * t,
        1,
        vec![
            0.3, 0.3, 0.4, //
            0.1, 0.2, 0.7, //
            0.9, 0.1, 0.0, //
            0.2, 0.7, 0.1, //
            0.2, 0.5, 0.3, //
            0.8, 0.1, 0.1, //
            0.1, 0.8, 0.1, //
            0.3, 0.3, 0.4, //
        ],
    );
    let tokens = Grid::new(1, 2 * t, 1, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0, 0.0, 0.0]);
    let kernel = ArgmaxCopy { t, vocab: v };

    let out = run(&kernel, &[&probs, &tokens], &[2], 1, 2 * t, 1).unwrap();
    assert_eq!(out.data, vec![1.0, 1.0, 2.0, 0.0, 2.0, 2.0, 0.0, 0.0]);

    // t = 0 has no preceding prediction and is copied through.
    let out = run(&kernel, &[&probs, &tokens], &[0], 1, 2 * t, 1).unwrap();
    assert_eq!(out.data, tokens.data);
}

#[test]
fn test_argmax_copy_requires_uniform() {
    let probs = Grid::new(2, 2, 1, vec![0.5; 4]);
    let tokens = Grid::new(1, 2, 1, vec![0.0; 2]);
    let err = run(&ArgmaxCopy { t: 2, vocab: 2 }, &[&probs, &tokens], &[], 1, 2, 1).unwrap_err();
    assert_eq!(err, KernelFault::MissingUniform(0));
}

#[test]
fn test_out_of_bounds_fetch_faults() {
    // Linear declared wider than its input
    let input = Grid::new(2, 1, 1, vec![1.0, 2.0]);
    let weight = Grid::new(3, 1, 1, vec![1.0, 1.0, 1.0]);
    let err = run(&Linear { n_in: 3, bias: false }, &[&input, &weight], &[], 1, 1, 1).unwrap_err();
    assert!(matches!(err, KernelFault::OutOfBounds { slot: 0, x: 2, .. }));
}
