//! Basic Sine Wave Simulation
//!
//! Runs the per-bin recursion with the NLMS gain on sine waves: a 440Hz far-end tone
//! echoed into the microphone, and an 880Hz near-end tone that starts after 0.5 seconds.
//! Prints the Root Mean Square (RMS) energy before and after processing.
//!
//! ## How to Run
//!
//! ```sh
//! cargo run --example basic_simulation
//! ```

use nkf_aec::{AudioBuffer, EchoCanceller, NkfConfig, NlmsGain};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Running Basic Sine Wave AEC Simulation ---");

    const SAMPLE_RATE: u32 = 16000;
    let total = (SAMPLE_RATE * 2) as usize;

    let config = NkfConfig::default();
    let aec = EchoCanceller::with_predictor(NlmsGain::new(config.filter_order, 0.5)?, config)?;

    // --- Signal Generation ---
    // 1. Far-end signal: A 440Hz sine wave, representing the audio from the loudspeaker.
    let far_end_signal: Vec<f32> = (0..total)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            0.6 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect();

    // 2. Near-end signal: An 880Hz sine wave, representing the local user's voice.
    //    It starts after 0.5 seconds to create a period of single-talk (echo only).
    let mut near_end_signal = vec![0.0; total];
    for (i, sample) in near_end_signal.iter_mut().enumerate().skip((SAMPLE_RATE / 2) as usize) {
        let t = i as f32 / SAMPLE_RATE as f32;
        *sample = 0.4 * (2.0 * std::f32::consts::PI * 880.0 * t).sin();
    }

    // 3. Microphone signal: near-end plus a delayed, attenuated far-end echo.
    let echo_delay_samples = 128;
    let echo_attenuation = 0.7;
    let mut mic_signal = vec![0.0; total];
    for i in echo_delay_samples..total {
        mic_signal[i] =
            near_end_signal[i] + far_end_signal[i - echo_delay_samples] * echo_attenuation;
    }

    // --- AEC Processing ---
    let processed = aec.process(
        &AudioBuffer::new(mic_signal.clone(), SAMPLE_RATE),
        &AudioBuffer::new(far_end_signal, SAMPLE_RATE),
        false,
    )?;
    let processed_signal = processed.samples;

    // --- Performance Analysis ---
    let split = (SAMPLE_RATE / 2) as usize;
    println!("\n--- AEC Performance Analysis (RMS Energy) ---");
    analyze_and_print_rms(
        "Single-Talk (Echo Only)",
        &mic_signal[..split],
        &processed_signal[..split],
    );
    analyze_and_print_rms(
        "Double-Talk (Echo + Voice)",
        &mic_signal[split..],
        &processed_signal[split..],
    );

    println!("\nExplanation:");
    println!("- Single-Talk: The RMS of the processed signal should be significantly lower, showing echo removal.");
    println!("- Double-Talk: The RMS should decrease (as echo is removed) but not go to zero, showing the near-end voice was preserved.");
    Ok(())
}

/// RMS of a signal slice.
fn rms(signal: &[f32]) -> f32 {
    if signal.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = signal.iter().map(|&x| x * x).sum();
    (sum_sq / signal.len() as f32).sqrt()
}

fn analyze_and_print_rms(label: &str, before: &[f32], after: &[f32]) {
    println!("\n[{}]", label);
    println!(" - Before AEC: {:.6}", rms(before));
    println!(" - After AEC:  {:.6}", rms(after));
}
