// tests/reconstruction_loss.rs - Masked multi-head loss properties
use burn::module::Param;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use seq_gen_rs::seqgen::architectures::base::batch::PaddedBatch;
use seq_gen_rs::seqgen::architectures::base::config::{EmbeddingFeature, FeatureLayout};
use seq_gen_rs::seqgen::architectures::base::embedding_predictor::EmbeddingPredictor;
use seq_gen_rs::seqgen::architectures::base::loss::ReconstructionLoss;
use seq_gen_rs::seqgen::architectures::base::rng::DeterministicRngContext;
use seq_gen_rs::test_utils::synthetic_batch;
use seq_gen_rs::{DataConfig, ModelConfig, SeqGen};

type TestBackend = NdArray<f32>;

// Layout: [cat (2) | num | delta] -> width 4
const NUM_COL: usize = 2;
const DELTA_COL: usize = 3;

fn configs() -> (ModelConfig, DataConfig) {
    let model = ModelConfig {
        features_emb_dim: 2,
        delta_weight: 1.0,
        ..ModelConfig::default()
    };
    let data = DataConfig {
        embeddings: vec![EmbeddingFeature::new("cat", 3, 4)],
        numeric_values: vec!["num".to_string()],
        ..DataConfig::default()
    };
    (model, data)
}

fn setup() -> (ReconstructionLoss, EmbeddingPredictor<TestBackend>) {
    let (model, data) = configs();
    let layout = FeatureLayout::new(&model, &data).unwrap();
    let ctx = DeterministicRngContext::new(0, <TestBackend as Backend>::Device::default());
    let predictor = EmbeddingPredictor::new(&layout, &data, &ctx, 300).unwrap();
    (ReconstructionLoss::new(&model, layout).unwrap(), predictor)
}

fn floats(data: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
    Tensor::from_data(TensorData::new(data, shape), &Default::default())
}

fn ints(data: Vec<i64>, shape: [usize; 2]) -> Tensor<TestBackend, 2, Int> {
    Tensor::from_data(TensorData::new(data, shape), &Default::default())
}

/// `[batch, steps, 4]` prediction with the numeric and delta columns filled in.
fn prediction(numeric: &[f32], delta: &[f32], batch: usize, steps: usize) -> Tensor<TestBackend, 3> {
    let mut data = vec![0.0; batch * steps * 4];
    for i in 0..batch * steps {
        data[i * 4 + NUM_COL] = numeric[i];
        data[i * 4 + DELTA_COL] = delta[i];
    }
    Tensor::from_data(TensorData::new(data, [batch, steps, 4]), &Default::default())
}

fn evaluate(
    pred: Tensor<TestBackend, 3>,
    batch: &PaddedBatch<TestBackend>,
) -> seq_gen_rs::LossBreakdown {
    let (loss, predictor) = setup();
    let dist = predictor.forward(pred.clone()).unwrap();
    loss.compute(&predictor, pred, &dist, batch, &batch.time_steps)
        .unwrap()
        .breakdown
}

#[test]
fn test_mask_is_noop_without_padding() {
    let batch = PaddedBatch::new(floats(vec![0.0, 0.1, 0.2, 0.0, 0.2, 0.4], [2, 3]), vec![3, 3])
        .with_categorical("cat", ints(vec![1, 2, 3, 3, 2, 1], [2, 3]))
        .with_numeric("num", floats(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]));
    let pred_num = [1.5, 2.0, 4.0, 7.0];
    let breakdown = evaluate(prediction(&pred_num, &[0.0; 4], 2, 2), &batch);

    let targets = [2.0, 3.0, 5.0, 6.0];
    let unmasked: f32 = pred_num
        .iter()
        .zip(targets)
        .map(|(p, t)| (p - t) * (p - t))
        .sum::<f32>()
        / 4.0;
    assert!((breakdown.total_mse_loss() - unmasked).abs() < 1e-6);
}

#[test]
fn test_fully_padded_sequence_is_excluded() {
    // Second sequence has no numeric value after position 0.
    let batch = PaddedBatch::new(floats(vec![0.0, 0.1, 0.2, 0.0, 0.1, 0.2], [2, 3]), vec![3, 3])
        .with_categorical("cat", ints(vec![1, 2, 3, 1, 2, 3], [2, 3]))
        .with_numeric("num", floats(vec![9.0, 1.0, 2.0, 5.0, 0.0, 0.0], [2, 3]));
    let breakdown = evaluate(prediction(&[0.0; 4], &[0.0; 4], 2, 2), &batch);

    // Sequence 0 only: (1 + 4) / 2. Counting sequence 1 as zero would give 1.25.
    assert!((breakdown.total_mse_loss() - 2.5).abs() < 1e-6);
}

#[test]
fn test_zero_delta_for_constant_time() {
    let batch = PaddedBatch::new(floats(vec![0.5, 0.5, 0.5, 0.5, 0.5, -1.0], [2, 3]), vec![3, 2])
        .with_categorical("cat", ints(vec![1, 2, 3, 1, 2, 0], [2, 3]))
        .with_numeric("num", floats(vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0], [2, 3]));
    let breakdown = evaluate(prediction(&[1.0; 4], &[0.0; 4], 2, 2), &batch);

    assert_eq!(breakdown.delta_loss(), 0.0);
    assert_eq!(breakdown.total_mse_loss(), 0.0);
}

#[test]
fn test_delta_uses_single_fused_average() {
    // Valid deltas: seq 0 -> 2 positions, seq 1 -> 1 position.
    let batch = PaddedBatch::new(floats(vec![0.0, 1.0, 3.0, 0.0, 4.0, -1.0], [2, 3]), vec![3, 2])
        .with_categorical("cat", ints(vec![1, 2, 3, 1, 2, 0], [2, 3]))
        .with_numeric("num", floats(vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0], [2, 3]));
    let breakdown = evaluate(prediction(&[1.0; 4], &[0.0; 4], 2, 2), &batch);

    // (1 + 4 + 16) / 3, not mean(2.5, 16)
    assert!((breakdown.delta_loss() - 7.0).abs() < 1e-5);
}

#[test]
fn test_confident_correct_logits_give_near_zero_head_loss() {
    let (loss, mut predictor) = setup();
    let device = <TestBackend as Backend>::Device::default();
    // Head ignores its input and always favours class 2.
    predictor.heads[0].weight = Param::from_tensor(Tensor::zeros([4, 2], &device));
    predictor.heads[0].bias = Some(Param::from_tensor(Tensor::from_floats([0.0, 0.0, 20.0, 0.0], &device)));

    let batch = PaddedBatch::new(floats(vec![0.0, 0.1, 0.2, 0.0, 0.1, -1.0], [2, 3]), vec![3, 2])
        .with_categorical("cat", ints(vec![1, 2, 2, 3, 2, 0], [2, 3]))
        .with_numeric("num", floats(vec![1.0, 1.0, 1.0, 1.0, 1.0, 0.0], [2, 3]));
    let pred = prediction(&[0.0; 4], &[0.0; 4], 2, 2);
    let dist = predictor.forward(pred.clone()).unwrap();

    let head = predictor.loss(&dist, &batch).unwrap();
    assert_eq!(head["cat"].valid_count, 3);
    let value = head["cat"].scalar();
    assert!((0.0..1e-6).contains(&value), "head loss {value}");

    // The model loss smooths labels, so its minimum is well above zero but
    // still below the loss of a confidently wrong head.
    let smoothed = loss
        .compute(&predictor, pred.clone(), &dist, &batch, &batch.time_steps)
        .unwrap()
        .breakdown
        .get("cat")
        .unwrap();
    predictor.heads[0].bias = Some(Param::from_tensor(Tensor::from_floats([0.0, 20.0, 0.0, 0.0], &device)));
    let wrong_dist = predictor.forward(pred.clone()).unwrap();
    let wrong = loss
        .compute(&predictor, pred, &wrong_dist, &batch, &batch.time_steps)
        .unwrap()
        .breakdown
        .get("cat")
        .unwrap();
    assert!(smoothed > value);
    assert!(smoothed < wrong);
}

#[test]
fn test_all_padding_labels_are_undefined() {
    let batch = PaddedBatch::new(floats(vec![0.0, 0.1, 0.2, 0.0, 0.1, 0.2], [2, 3]), vec![3, 3])
        .with_categorical("cat", ints(vec![1, 0, 0, 2, 0, 0], [2, 3]))
        .with_numeric("num", floats(vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0], [2, 3]));
    let breakdown = evaluate(prediction(&[0.0; 4], &[0.0; 4], 2, 2), &batch);

    assert!(breakdown.get("cat").unwrap().is_nan());
    assert!(breakdown.total_ce_loss().is_nan());

    // The undefined term contributes nothing to the aggregate.
    let expected = breakdown.total_mse_loss() + breakdown.delta_loss();
    assert!(breakdown.total_loss().is_finite());
    assert!((breakdown.total_loss() - expected).abs() < 1e-5);
}

#[test]
fn test_end_to_end_total_matches_components() {
    let (model_config, data) = configs();
    let device = <TestBackend as Backend>::Device::default();
    let model = SeqGen::<TestBackend>::new(&model_config, &data, &device).unwrap();
    let batch = synthetic_batch::<TestBackend>(&data, &[3, 5], 17, &device);

    let output = model.forward(&batch).unwrap();
    let loss = model.loss(&output, &batch).unwrap();
    let b = &loss.breakdown;

    assert_eq!(b.len(), 5);
    for key in ["total_mse_loss", "total_CE_loss", "delta_loss", "total_loss", "cat"] {
        assert!(b.get(key).is_some(), "missing {key}");
    }
    assert_eq!(b.total_ce_loss(), b.get("cat").unwrap());

    let expected = b.total_mse_loss() + b.total_ce_loss() + model_config.delta_weight * b.delta_loss();
    assert!(
        (b.total_loss() - expected).abs() <= 1e-5 * expected.abs().max(1.0),
        "total {} vs components {}",
        b.total_loss(),
        expected
    );
    let tensor_total = loss.total_loss.into_scalar();
    assert!((tensor_total - b.total_loss()).abs() < 1e-6);
}

#[test]
fn test_weights_scale_components() {
    let (mut model_config, data) = configs();
    model_config.mse_weight = 0.0;
    model_config.ce_weight = 2.0;
    model_config.delta_weight = 0.0;
    let device = <TestBackend as Backend>::Device::default();
    let model = SeqGen::<TestBackend>::new(&model_config, &data, &device).unwrap();
    let batch = synthetic_batch::<TestBackend>(&data, &[4, 2, 3], 5, &device);

    let output = model.forward(&batch).unwrap();
    let b = model.loss(&output, &batch).unwrap().breakdown;

    // Zero weights still report their components.
    assert!(b.total_mse_loss() > 0.0);
    assert!(b.delta_loss() >= 0.0);
    assert!((b.total_loss() - 2.0 * b.total_ce_loss()).abs() < 1e-5);
}

#[test]
fn test_no_valid_position_anywhere_leaves_total_undefined() {
    // Every sequence has a single event inside a padded length of two.
    let batch = PaddedBatch::new(floats(vec![0.0, -1.0, 0.0, -1.0], [2, 2]), vec![1, 1])
        .with_categorical("cat", ints(vec![1, 0, 2, 0], [2, 2]))
        .with_numeric("num", floats(vec![1.0, 0.0, 2.0, 0.0], [2, 2]));
    let (loss, predictor) = setup();
    let pred = prediction(&[0.5; 2], &[0.5; 2], 2, 1);
    let dist = predictor.forward(pred.clone()).unwrap();
    let out = loss
        .compute(&predictor, pred, &dist, &batch, &batch.time_steps)
        .unwrap();

    for (key, value) in out.breakdown.iter() {
        assert!(value.is_nan(), "{key} = {value}");
    }
    // Nothing flows back from a batch without targets.
    assert_eq!(out.total_loss.into_scalar(), 0.0);
}

#[test]
fn test_numeric_columns_follow_configuration_order() {
    // Layout: [cat (2) | a | b | delta] -> width 5
    let (model, mut data) = configs();
    data.numeric_values = vec!["a".to_string(), "b".to_string()];
    let layout = FeatureLayout::new(&model, &data).unwrap();
    assert_eq!(layout.input_dim(), 5);
    let ctx = DeterministicRngContext::new(0, <TestBackend as Backend>::Device::default());
    let predictor = EmbeddingPredictor::new(&layout, &data, &ctx, 300).unwrap();
    let loss = ReconstructionLoss::new(&model, layout).unwrap();

    let batch = PaddedBatch::new(floats(vec![0.0, 0.1, 0.2], [1, 3]), vec![3])
        .with_categorical("cat", ints(vec![1, 2, 3], [1, 3]))
        .with_numeric("a", floats(vec![9.0, 1.0, 2.0], [1, 3]))
        .with_numeric("b", floats(vec![9.0, 10.0, 20.0], [1, 3]));

    // Columns 2 and 3 hold `a` and `b`; the delta column is exact.
    let pred: Tensor<TestBackend, 3> = Tensor::from_data(
        TensorData::new(
            vec![0.0, 0.0, 0.0, 10.0, 0.1, 0.0, 0.0, 2.0, 18.0, 0.1],
            [1, 2, 5],
        ),
        &Default::default(),
    );
    let dist = predictor.forward(pred.clone()).unwrap();
    let breakdown = loss
        .compute(&predictor, pred, &dist, &batch, &batch.time_steps)
        .unwrap()
        .breakdown;

    // a: (1 + 0) / 2, b: (0 + 4) / 2. Swapped columns would give 168.5 + 212.
    assert!((breakdown.total_mse_loss() - 2.5).abs() < 1e-5);
    assert!(breakdown.delta_loss() < 1e-10);
}

#[test]
fn test_model_without_deltas_reports_zero_delta() {
    let (mut model_config, data) = configs();
    model_config.use_deltas = false;
    let device = <TestBackend as Backend>::Device::default();
    let model = SeqGen::<TestBackend>::new(&model_config, &data, &device).unwrap();
    assert_eq!(model.input_dim(), 3);
    let batch = synthetic_batch::<TestBackend>(&data, &[4, 2], 9, &device);

    let output = model.forward(&batch).unwrap();
    assert_eq!(output.pred.dims(), [2, 3, 3]);
    let b = model.loss(&output, &batch).unwrap().breakdown;

    assert_eq!(b.len(), 5);
    assert_eq!(b.delta_loss(), 0.0);
    let expected = b.total_mse_loss() + b.total_ce_loss();
    assert!((b.total_loss() - expected).abs() <= 1e-5 * expected.abs().max(1.0));
}
