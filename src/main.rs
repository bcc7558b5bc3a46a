use burn_ndarray::NdArray;
use seq_gen_rs::test_utils::synthetic_batch;
use seq_gen_rs::{settings, DataConfig, ModelConfig, SeqGen};

type Backend = NdArray<f32>;

fn run() -> seq_gen_rs::Result<()> {
    let config = settings();

    let mut model_config = match &config.model.model_config_path {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::rosbank(),
    };
    if let Some(seed) = config.model.seed {
        model_config.seed = seed;
    }
    let data_config = match &config.model.data_config_path {
        Some(path) => DataConfig::from_json_file(path)?,
        None => DataConfig::age(),
    };

    let device = Default::default();
    let model = SeqGen::<Backend>::new(&model_config, &data_config, &device)?;

    let batch = synthetic_batch::<Backend>(&data_config, &[12, 7, 9, 3], model_config.seed, &device);
    let output = model.forward(&batch)?;
    let loss = model.loss(&output, &batch)?;

    for (name, value) in loss.breakdown.iter() {
        log::info!("{:>16}: {:.6}", name, value);
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings().logging.level.as_str()))
        .init();

    log::info!("seq-gen starting...");
    if let Err(err) = run() {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
