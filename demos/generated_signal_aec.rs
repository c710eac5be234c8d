//! AEC Simulation with Generated Signals
//!
//! Generates white noise for the far-end signal and a sine wave for the near-end signal,
//! passes the far-end through a short FIR "room" to build the echo, and cancels it with
//! the NLMS-gain recursion. Saves far-end, near-end, microphone (before AEC) and output
//! (after AEC) as WAV files, and prints the residual echo per second of single-talk.
//!
//! ## How to Run
//!
//! ```sh
//! cargo run --example generated_signal_aec --release
//! ```

use nkf_aec::{AudioBuffer, EchoCanceller, NkfConfig, NlmsGain};
use rand::{rng, Rng};

const SAMPLE_RATE: u32 = 16000;
const DURATION_S: u32 = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Running AEC Simulation with Generated Signals ---");

    const STEP_SIZE: f32 = 0.3;
    const TOTAL_SAMPLES: usize = (SAMPLE_RATE * DURATION_S) as usize;

    let config = NkfConfig::default();
    let aec = EchoCanceller::with_predictor(NlmsGain::new(config.filter_order, STEP_SIZE)?, config)?;

    // --- 1. Signal Generation ---
    let mut rng = rng();

    // Far-end signal (white noise) to simulate a generic, broadband audio source.
    let far_end_signal: Vec<f32> = (0..TOTAL_SAMPLES)
        .map(|_| rng.random::<f32>() * 0.6 - 0.3)
        .collect();

    // Near-end signal (440Hz sine wave, from 2s to 4s) to simulate a user speaking.
    let mut near_end_signal = vec![0.0; TOTAL_SAMPLES];
    let start_sample = (SAMPLE_RATE * 2) as usize;
    let end_sample = (SAMPLE_RATE * 4) as usize;
    for (i, sample) in near_end_signal
        .iter_mut()
        .enumerate()
        .take(end_sample)
        .skip(start_sample)
    {
        let t = i as f32 / SAMPLE_RATE as f32;
        *sample = 0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
    }

    // --- 2. Echo Simulation ---
    // A simple FIR filter to simulate a Room Impulse Response (RIR) with a few reflections.
    let rir = [0.6, 0.0, 0.0, -0.15, 0.0, 0.08, 0.0, 0.03];
    let mut echo_signal = vec![0.0; TOTAL_SAMPLES];
    for i in 0..TOTAL_SAMPLES {
        for (j, &coeff) in rir.iter().enumerate() {
            let delay = j * 20; // space out reflections
            if i >= delay {
                echo_signal[i] += far_end_signal[i - delay] * coeff;
            }
        }
    }

    // --- 3. Microphone Signal Creation ---
    let mic_signal: Vec<f32> = echo_signal
        .iter()
        .zip(near_end_signal.iter())
        .map(|(&echo, &near)| (echo + near).clamp(-1.0, 1.0))
        .collect();

    // --- 4. AEC Processing ---
    let processed = aec.process(
        &AudioBuffer::new(mic_signal.clone(), SAMPLE_RATE),
        &AudioBuffer::new(far_end_signal.clone(), SAMPLE_RATE),
        false,
    )?;
    let processed_signal = processed.samples;

    println!("\nResidual echo during single-talk (first 2 s):");
    for second in 0..2 {
        let range = second * SAMPLE_RATE as usize..(second + 1) * SAMPLE_RATE as usize;
        let before = energy_db(&mic_signal[range.clone()]);
        let after = energy_db(&processed_signal[range]);
        println!(" - second {}: {:6.1} dB -> {:6.1} dB", second, before, after);
    }

    // --- 5. Save Results to WAV Files ---
    let output_dir = "output_generated";
    std::fs::create_dir_all(output_dir)?;

    save_wav(format!("{}/01_farend.wav", output_dir), &far_end_signal)?;
    save_wav(format!("{}/02_nearend.wav", output_dir), &near_end_signal)?;
    save_wav(format!("{}/03_mic_before_aec.wav", output_dir), &mic_signal)?;
    save_wav(format!("{}/04_mic_after_aec.wav", output_dir), &processed_signal)?;

    println!("\nSimulation complete!");
    println!("WAV files saved in '{}' directory.", output_dir);
    println!("- 03_mic_before_aec.wav: Contains echo + voice.");
    println!("- 04_mic_after_aec.wav: Should contain only voice.");
    Ok(())
}

fn energy_db(signal: &[f32]) -> f32 {
    let mean_sq = signal.iter().map(|&x| x * x).sum::<f32>() / signal.len().max(1) as f32;
    10.0 * (mean_sq + 1e-12).log10()
}

/// Saves an f32 signal slice as a 16-bit PCM WAV file.
fn save_wav(path: String, signal: &[f32]) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)?;
    for &sample in signal.iter() {
        let amplitude = i16::MAX as f32;
        writer.write_sample((sample.clamp(-1.0, 1.0) * amplitude) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}
