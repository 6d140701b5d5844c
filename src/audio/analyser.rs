//! Frequency-domain analysis of raw PCM
//!
//! Produces byte-scaled magnitude bins with the same conventions as a web
//! audio analyser node (Blackman window, temporal smoothing, decibel range
//! mapped onto 0-255), so volume thresholds mean the same thing everywhere.

use std::f32::consts::PI;

/// Analysis window length in samples
pub const FFT_SIZE: usize = 512;
/// Decibel level mapped to 0
pub const MIN_DECIBELS: f32 = -100.0;
/// Decibel level mapped to 255
pub const MAX_DECIBELS: f32 = -30.0;
/// Weight of the previous frame in the smoothed magnitudes
pub const SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// Average bin level, 0-255
pub fn average_level(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| b as u32).sum();
    sum as f32 / bins.len() as f32
}

/// Average normalized volume, 0-100
pub fn average_volume(bins: &[u8]) -> f32 {
    average_level(bins) / 255.0 * 100.0
}

/// Discrete Fourier analyser over a fixed window
pub struct FrequencyAnalyser {
    fft_size: usize,
    cos_table: Vec<f32>,
    sin_table: Vec<f32>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
}

impl FrequencyAnalyser {
    pub fn new(fft_size: usize) -> Self {
        let n = fft_size.max(2);
        let cos_table = (0..n)
            .map(|i| (2.0 * PI * i as f32 / n as f32).cos())
            .collect();
        let sin_table = (0..n)
            .map(|i| (2.0 * PI * i as f32 / n as f32).sin())
            .collect();
        // Blackman
        let window = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();

        Self {
            fft_size: n,
            cos_table,
            sin_table,
            window,
            smoothed: vec![0.0; n / 2],
        }
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Analyse the most recent `fft_size` samples into `out`
    ///
    /// Shorter input is zero-padded at the front. Only the first
    /// `min(out.len(), bin_count())` bins are written.
    pub fn analyse(&mut self, samples: &[f32], out: &mut [u8]) {
        let n = self.fft_size;
        let mut frame = vec![0.0f32; n];
        let take = samples.len().min(n);
        frame[n - take..].copy_from_slice(&samples[samples.len() - take..]);
        for (x, w) in frame.iter_mut().zip(&self.window) {
            *x *= w;
        }

        let range = MAX_DECIBELS - MIN_DECIBELS;
        for (k, slot) in out.iter_mut().take(self.bin_count()).enumerate() {
            let mut re = 0.0f32;
            let mut im = 0.0f32;
            for (i, &x) in frame.iter().enumerate() {
                let idx = (k * i) % n;
                re += x * self.cos_table[idx];
                im -= x * self.sin_table[idx];
            }
            let magnitude = (re * re + im * im).sqrt() / n as f32;
            let smoothed = SMOOTHING_TIME_CONSTANT * self.smoothed[k]
                + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            self.smoothed[k] = smoothed;

            *slot = if smoothed <= 0.0 {
                0
            } else {
                let db = 20.0 * smoothed.log10();
                (255.0 / range * (db - MIN_DECIBELS)).clamp(0.0, 255.0) as u8
            };
        }
    }
}

impl Default for FrequencyAnalyser {
    fn default() -> Self {
        Self::new(FFT_SIZE)
    }
}
