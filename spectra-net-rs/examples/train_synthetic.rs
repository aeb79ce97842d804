//! Train a small spectrum regressor on synthetic resonance curves.
//!
//! Each record has two inputs (centre and width of a Lorentzian peak) and a
//! 200-point curve as target. No data files are needed.
//!
//! Usage:
//!   cargo run --example train_synthetic --release
//!
//! With CUDA:
//!   cargo run --example train_synthetic --release --features cuda

use std::time::Instant;

use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use spectra_net_rs::prelude::*;
use spectra_net_rs::data::{InMemoryStream, Record};
use spectra_net_rs::optimizer::OptimizerKind;
use spectra_net_rs::scheduler::ExponentialDecay;
use spectra_net_rs::MemorySummary;

const POINTS: usize = 200;

fn lorentzian(rng: &mut StdRng) -> Record {
    let centre: f32 = rng.gen_range(0.2..0.8);
    let width: f32 = rng.gen_range(0.02..0.1);
    let labels = (0..POINTS)
        .map(|i| {
            let x = i as f32 / POINTS as f32;
            let d = (x - centre) / width;
            1.0 / (1.0 + d * d)
        })
        .collect();
    Record {
        features: vec![centre, width * 10.0],
        labels,
    }
}

fn main() -> anyhow::Result<()> {
    println!("=== Spectra-net synthetic training ===\n");

    let device = Device::cuda_if_available(0)?;
    println!("Device: {:?}", device);

    let steps: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    let mut rng = StdRng::seed_from_u64(7);
    let train: Vec<Record> = (0..800).map(|_| lorentzian(&mut rng)).collect();
    let valid: Vec<Record> = (0..100).map(|_| lorentzian(&mut rng)).collect();

    let spec = ArchitectureSpec::new(vec![50, 50], vec![100, 200], vec![8, 4])?;
    let options = NetworkOptions {
        input_size: 2,
        variant: ArchitectureVariant::TconvRefine,
        ..Default::default()
    };
    let network = RegressionNetwork::new(&spec, options, &device)?;
    println!("Parameters: {}", network.parameter_count());
    println!("Strides: {:?}", network.schedule().strides());
    println!();

    let train_stream = InMemoryStream::new(train, 32, &device)?.with_shuffle(64, 1);
    let valid_stream = InMemoryStream::new(valid, 50, &device)?;

    let mut trainer = Trainer::new(
        network,
        OptimizerKind::Adam,
        ExponentialDecay::new(1e-3, 2000, 0.9)?,
        Box::new(train_stream),
    )?
    .with_sink(Box::new(MemorySummary::new()));
    trainer.register_hook(Box::new(TrainProgressHook::new(100)?));
    trainer.register_hook(Box::new(
        ValidationHook::new(250, Box::new(valid_stream))?.with_curve_num(4),
    ));

    let start = Instant::now();
    let report = trainer.run_training(steps)?;
    let elapsed = start.elapsed();

    println!();
    println!("=== Training Complete ===");
    println!("Steps: {}", report.steps);
    println!("Final loss: {:?}", report.final_loss);
    for (step, loss) in &report.validation_losses {
        println!("  valid @ {step}: {loss:.4e}");
    }
    println!(
        "Time: {:.1}s ({:.1} steps/s)",
        elapsed.as_secs_f64(),
        report.steps as f64 / elapsed.as_secs_f64()
    );

    Ok(())
}
