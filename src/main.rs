use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

use spectracal::CalibrationConfig;
use spectracal::calibration::calibrate_energy;
use spectracal::config::TH228_LINES;

const KEV_PER_ADC: f64 = 0.4;

/// Uncalibrated Th-228 lines on a flat background.
fn synthetic_spectrum(seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::new();
    for (i, energy) in TH228_LINES.iter().enumerate() {
        let sigma = (0.8 + 3e-4 * energy).sqrt();
        let Ok(line) = Normal::new(energy / KEV_PER_ADC, sigma / KEV_PER_ADC) else {
            continue;
        };
        let n = if i == TH228_LINES.len() - 1 { 20_000 } else { 5_000 };
        samples.extend((0..n).map(|_| line.sample(&mut rng)));
    }
    let background = Uniform::new(400.0 / KEV_PER_ADC, 2800.0 / KEV_PER_ADC);
    samples.extend((0..50_000).map(|_| background.sample(&mut rng)));
    samples
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init(); // RUST_LOG=debug for per-fit output

    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("reading calibration config from {path}");
            CalibrationConfig::from_yaml_str(&std::fs::read_to_string(path)?)?
        }
        None => CalibrationConfig::default(),
    };

    let samples = synthetic_spectrum(42);
    let calibration = calibrate_energy(&samples, &config)?;
    for warning in calibration.diagnostics.warnings() {
        log::warn!("{warning:?}");
    }
    log::info!("calibration {}", calibration.curve.function);
    println!("{}", serde_json::to_string_pretty(&calibration)?);
    Ok(())
}
