use anyhow::{anyhow, Result};
use clap::Parser;
use qnn_rs::core::buffer::DType;
use qnn_rs::core::tensor::Tensor;
use qnn_rs::memory::pool::PoolAllocator;
use qnn_rs::model::{config::ModelConfig, EngineOptions, Model};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a quantized graph on CPU", long_about = None)]
struct Args {
    /// Graph configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Flat weight blob referenced by the configuration's locations
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Benchmark kernel candidates and persist the dispatch table instead
    /// of executing
    #[arg(long, default_value_t = false)]
    tuning: bool,

    /// Map weights through the cross-process shared region
    #[arg(long, default_value_t = false)]
    shared_weight: bool,

    /// Dispatch table location (default: env or ~/.cache/qnn_workspace)
    #[arg(long)]
    dispatch_table: Option<PathBuf>,

    /// Forward passes to run
    #[arg(long, default_value_t = 1)]
    iters: usize,
}

/// Random data matching a declared model input, with dynamic axes pinned
/// to 1.
fn synthetic_input(name: &str, dtype: &str, shape: &[i64]) -> Result<Tensor> {
    let dims: Vec<usize> = shape
        .iter()
        .map(|&d| if d < 0 { 1 } else { d as usize })
        .collect();
    let dtype = DType::from_str(dtype)?;
    let numel: usize = dims.iter().product();
    let mut rng = rand::rng();
    let bytes: Vec<u8> = match dtype {
        DType::S8 => (0..numel).map(|_| rng.random_range(-127i8..=127) as u8).collect(),
        DType::S32 => (0..numel).flat_map(|_| 1i32.to_le_bytes()).collect(),
        DType::F32 => (0..numel)
            .flat_map(|_| rng.random_range(-1.0f32..1.0).to_le_bytes())
            .collect(),
        other => return Err(anyhow!("no synthetic data for dtype {}", other.as_str())),
    };
    Ok(Tensor::from_data(name, dtype, dims, bytes))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut options = EngineOptions::from_env();
    options.tuning |= args.tuning;
    options.shared_weight |= args.shared_weight;
    if let Some(table) = args.dispatch_table {
        options.dispatch_table_path = table;
    }

    let conf = ModelConfig::from_file(&args.config)?;
    let alloc = Arc::new(PoolAllocator::new());
    let mut model = Model::from_config(&conf, args.weights.as_deref(), alloc, options)?;

    let mut inputs = Vec::new();
    for op in &conf.operators {
        if op.op_type != "Input" {
            continue;
        }
        for out in &op.outputs {
            if !out.is_weight() {
                inputs.push(synthetic_input(&out.name, &out.dtype, &out.shape)?);
            }
        }
    }

    for iter in 0..args.iters.max(1) {
        let start = Instant::now();
        let outputs = model.forward(&inputs)?;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        println!("pass {}: {:.3} ms", iter, ms);
        for out in &outputs {
            println!(
                "  output '{}' {:?} {}",
                out.name(),
                out.shape(),
                out.dtype().as_str()
            );
        }
    }
    Ok(())
}
