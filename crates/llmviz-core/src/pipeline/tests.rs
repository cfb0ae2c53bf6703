use super::*;
use crate::config::GptConfig;
use crate::tensor::TensorView;

fn small_set() -> TensorSet {
    TensorSet::synthetic(&GptConfig::new(2, 2, 8, 5, 4), 3).unwrap()
}

fn build(set: &TensorSet, batch: usize) -> Result<GptPipeline> {
    let ctx = ComputeContext::new()?;
    GptPipeline::build(&ctx, set, &PipelineOptions::default().with_batch_size(batch))
}

#[test]
fn test_stable_buffer_names() {
    let pipeline = build(&small_set(), 2).unwrap();
    let names: Vec<&str> = pipeline.buffer_names().collect();

    for expected in [
        "input.tokens",
        "input.positions",
        "wte.output",
        "wpe.output",
        "embed.output",
        "block0.ln1.agg",
        "block0.ln1.output",
        "block0.attn.qkv",
        "block0.attn.scores",
        "block0.attn.agg",
        "block0.attn.softmax",
        "block0.attn.scaled",
        "block0.attn.proj",
        "block0.attn.output",
        "block0.ln2.agg",
        "block0.ln2.output",
        "block0.mlp.fc",
        "block0.mlp.gelu",
        "block0.mlp.proj",
        "block0.output",
        "block1.output",
        "ln_f.agg",
        "ln_f.output",
        "lm_head.output",
        "softmax.agg",
        "softmax.output",
        "loop.next_tokens",
        "transformer.h.1.attn.c_attn.weight",
        "lm_head.weight",
    ] {
        assert!(names.contains(&expected), "missing buffer {expected}");
    }
    assert!(!names.contains(&"transformer.h.0.attn.bias"));
    assert!(!names.contains(&"block2.output"));
}

#[test]
fn test_buffer_extents() {
    let pipeline = build(&small_set(), 2).unwrap();
    let extent = |name: &str| {
        let b = pipeline.buffer(name).unwrap();
        (b.width(), b.height(), b.channels())
    };

    // B=2 T=4 C=8 H=2 A=4 V=5
    assert_eq!(extent("input.tokens"), (1, 8, 1));
    assert_eq!(extent("embed.output"), (8, 8, 1));
    assert_eq!(extent("block0.ln1.agg"), (1, 8, 2));
    assert_eq!(extent("block0.attn.qkv"), (4, 16, 3));
    assert_eq!(extent("block0.attn.scores"), (4, 16, 1));
    assert_eq!(extent("block0.attn.agg"), (1, 16, 2));
    assert_eq!(extent("block0.attn.scaled"), (8, 8, 1));
    assert_eq!(extent("block0.mlp.fc"), (32, 8, 1));
    assert_eq!(extent("lm_head.output"), (5, 8, 1));
    assert_eq!(extent("transformer.h.0.attn.c_attn.weight"), (8, 8, 3));
    assert_eq!(extent("transformer.h.0.attn.c_attn.bias"), (1, 8, 3));
    assert_eq!(extent("transformer.h.0.mlp.c_fc.weight"), (8, 32, 1));
    assert_eq!(extent("transformer.ln_f.weight"), (1, 8, 1));
}

#[test]
fn test_unknown_buffer() {
    let pipeline = build(&small_set(), 1).unwrap();
    assert!(matches!(
        pipeline.buffer("block9.output"),
        Err(PipelineError::UnknownBuffer(name)) if name == "block9.output"
    ));
}

#[test]
fn test_phase_order_and_registry_sharing() {
    let pipeline = build(&small_set(), 1).unwrap();
    let labels: Vec<&str> = pipeline.phases().iter().map(Phase::label).collect();

    assert_eq!(labels.len(), 3 + 15 * 2 + 5);
    assert_eq!(&labels[..4], &["wte.output", "wpe.output", "embed.output", "block0.ln1.agg"]);
    assert_eq!(
        &labels[4..18],
        &[
            "block0.ln1.apply",
            "block0.attn.qkv",
            "block0.attn.selfAttend",
            "block0.attn.agg",
            "block0.attn.softmax",
            "block0.attn.scaled",
            "block0.attn.proj",
            "block0.attn.output",
            "block0.ln2.agg",
            "block0.ln2.apply",
            "block0.mlp.fc",
            "block0.mlp.gelu",
            "block0.mlp.proj",
            "block0.output",
        ]
    );
    assert_eq!(
        &labels[labels.len() - 5..],
        &["ln_f.agg", "ln_f.apply", "lm_head.output", "softmax.agg", "softmax.apply"]
    );
    assert_eq!(pipeline.copy_phase().label(), "copy");

    // One program per distinct definition; attn proj and mlp fc share a linear.
    assert_eq!(pipeline.registry().len(), 17);
    assert!(pipeline.registry().hits() > 0);
}

#[test]
fn test_every_destination_has_one_writer() {
    let pipeline = build(&small_set(), 1).unwrap();
    let mut writers: HashMap<u64, &str> = HashMap::new();
    for phase in pipeline.phases().iter().chain([pipeline.copy_phase()]) {
        for dest in phase.dests() {
            if let Some(previous) = writers.insert(dest.id(), phase.label()) {
                panic!("{} written by {previous} and {}", dest.label(), phase.label());
            }
        }
    }
}

#[test]
fn test_qkv_weight_staging_layout() {
    let set = small_set();
    let pipeline = build(&set, 1).unwrap();
    let name = "transformer.h.0.attn.c_attn.weight";
    let source = set.require(name).unwrap();
    let staged = pipeline.buffer(name).unwrap().to_vec().unwrap();

    let (h, a, c) = (2, 4, 8);
    for head in 0..h {
        for ai in 0..a {
            for ci in 0..c {
                for ch in 0..3 {
                    let row = (head * a + ai) * c + ci;
                    let expected = source.get(&[ch * c + head * a + ai, ci]).unwrap();
                    assert_eq!(staged[row * 3 + ch], expected);
                }
            }
        }
    }
}

#[test]
fn test_positions_written_per_row() {
    let pipeline = build(&small_set(), 2).unwrap();
    let positions = pipeline.buffer("input.positions").unwrap().to_vec().unwrap();
    assert_eq!(positions, vec![0.0, 1.0, 2.0, 3.0, 0.0, 1.0, 2.0, 3.0]);
}

#[test]
fn test_missing_tensor() {
    let set = small_set();
    let mut partial = TensorSet::new(set.config().clone());
    for (name, tensor) in set.iter() {
        if name != "transformer.h.1.ln_2.weight" {
            partial.insert(name, tensor.clone());
        }
    }
    let err = build(&partial, 1).unwrap_err();
    assert!(
        matches!(err, PipelineError::MissingTensor(ref name) if name == "transformer.h.1.ln_2.weight")
    );
}

#[test]
fn test_shape_mismatch_names_tensor() {
    let mut set = small_set();
    set.insert(
        "transformer.wpe.weight",
        TensorView::zeros(vec![5, 8]).unwrap(),
    );
    match build(&set, 1).unwrap_err() {
        PipelineError::ShapeMismatch {
            tensor,
            expected,
            actual,
        } => {
            assert_eq!(tensor, "transformer.wpe.weight");
            assert_eq!(expected, vec![4, 8]);
            assert_eq!(actual, vec![5, 8]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_indivisible_heads_rejected() {
    let mut set = small_set();
    set.config_mut().n_head = Some(3);
    assert!(matches!(build(&set, 1), Err(PipelineError::InvalidConfig(_))));
}

#[test]
fn test_optional_biases_may_be_absent() {
    let set = small_set();
    let mut stripped = TensorSet::new(set.config().clone());
    for (name, tensor) in set.iter() {
        if !name.ends_with("attn.c_proj.bias") && !name.ends_with("mlp.c_proj.bias") {
            stripped.insert(name, tensor.clone());
        }
    }
    let pipeline = build(&stripped, 1).unwrap();

    let proj = pipeline
        .phases()
        .iter()
        .find(|p| p.label() == "block0.attn.proj")
        .unwrap();
    assert_eq!(proj.sources().len(), 2);
    let fc = pipeline
        .phases()
        .iter()
        .find(|p| p.label() == "block0.mlp.fc")
        .unwrap();
    assert_eq!(fc.sources().len(), 3);
}
