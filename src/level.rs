use dasp::Sample;

/// Root-mean-square loudness of a block, with samples normalized to [-1, 1].
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples
        .iter()
        .map(|s| {
            let x = s.to_sample::<f32>();
            x * x
        })
        .sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// One step of the exponential moving average used for playback loudness.
pub fn ema(previous: f32, sample: f32, alpha: f32) -> f32 {
    (1.0 - alpha) * previous + alpha * sample
}
