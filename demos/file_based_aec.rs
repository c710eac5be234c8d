//! File-Based AEC Processing Tool
//!
//! Command-line utility that performs acoustic echo cancellation on WAV files.
//! It takes a far-end (reference) file and a microphone file, removes the echo of
//! the far-end signal from the microphone, and saves the result to a new WAV file.
//!
//! With `--weights` the gain comes from a trained network stored as a JSON tensor
//! blob; without it, the recursion runs with the NLMS gain and `--step-size`.
//!
//! ## How to Run
//!
//! ```sh
//! cargo run --example file_based_aec --release -- \
//!   --farend your_farend_file.wav \
//!   --mic your_mic_file.wav \
//!   --output your_output_file.wav \
//!   --weights resources/nkf_epoch70.json \
//!   --align
//! ```
//! The files must be mono and share one sample rate.

use clap::Parser;
use hound::{WavReader, WavSpec, WavWriter};
use nkf_aec::{AudioBuffer, EchoCanceller, JsonWeightStore, NkfConfig, NlmsGain};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the far-end signal WAV file (e.g., loudspeaker audio).
    #[clap(long, value_parser)]
    farend: PathBuf,

    /// Path to the microphone signal WAV file (contains echo and near-end speech).
    #[clap(long, value_parser)]
    mic: PathBuf,

    /// Path to save the processed output WAV file.
    #[clap(long, value_parser)]
    output: PathBuf,

    /// JSON weight blob for the gain network. Falls back to NLMS when omitted.
    #[clap(long, value_parser)]
    weights: Option<PathBuf>,

    /// Step size of the NLMS gain, used without `--weights`.
    #[clap(long, value_parser, default_value_t = 0.5)]
    step_size: f32,

    /// Estimate the echo path delay and shift the far-end signal before cancelling.
    #[clap(long)]
    align: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    println!("--- Running File-Based AEC ---");
    println!("- Far-end file: {}", args.farend.display());
    println!("- Mic file:     {}", args.mic.display());
    println!("- Output file:  {}", args.output.display());
    match &args.weights {
        Some(path) => println!("- Weights:      {}", path.display()),
        None => println!("- Step size:    {} (NLMS)", args.step_size),
    }
    println!("- Align:        {}", args.align);

    // --- 1. Load WAV files ---
    let (far_signal, far_spec) = read_wav(&args.farend)?;
    let (mic_signal, mic_spec) = read_wav(&args.mic)?;

    if mic_spec.channels != 1 || far_spec.channels != 1 {
        return Err("input WAV files must be mono".into());
    }
    if mic_spec.sample_rate != far_spec.sample_rate {
        return Err(format!(
            "sample rates differ: mic {} Hz, far-end {} Hz",
            mic_spec.sample_rate, far_spec.sample_rate
        )
        .into());
    }

    let mic = AudioBuffer::new(mic_signal, mic_spec.sample_rate);
    let far = AudioBuffer::new(far_signal, far_spec.sample_rate);

    // --- 2. Initialize AEC and process ---
    let config = NkfConfig::default();
    let processed = match &args.weights {
        Some(path) => {
            let tensors = JsonWeightStore::load_file(path)?;
            let aec = EchoCanceller::from_tensors(&tensors, config)?;
            println!("\nLoaded gain network with {} parameters", aec.predictor().num_params());
            aec.process(&mic, &far, args.align)?
        }
        None => {
            let gain = NlmsGain::new(config.filter_order, args.step_size)?;
            EchoCanceller::with_predictor(gain, config)?.process(&mic, &far, args.align)?
        }
    };

    // --- 3. Save Output WAV File ---
    let out_spec = WavSpec {
        channels: 1,
        sample_rate: processed.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = WavWriter::create(&args.output, out_spec)?;
    for &sample in processed.samples.iter() {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;

    println!("\nProcessing complete!");
    println!(
        "{:.2} s of audio saved to '{}'",
        processed.duration_secs(),
        args.output.display()
    );
    Ok(())
}

/// Reads a WAV file and converts its samples to a Vec<f32> in the range [-1.0, 1.0].
fn read_wav(path: &PathBuf) -> Result<(Vec<f32>, WavSpec), Box<dyn std::error::Error>> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let max_val = 2_i32.pow(spec.bits_per_sample as u32 - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok((samples, spec))
}
