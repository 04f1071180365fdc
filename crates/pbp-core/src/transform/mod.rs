//! Spectral analysis
//!
//! The aggregator talks to the analysis step through [`SpectralAnalyzer`].
//! [`WelchAnalyzer`] is the bundled implementation: a Welch power spectral
//! density estimate with a periodic Hann window, 50% overlap, mean removal per
//! frame and density scaling (units²/Hz).

use anyhow::Result;
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

/// One power spectral density estimate
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Bin centre frequencies in Hz
    pub frequencies: Vec<f32>,
    pub psd: Vec<f32>,
}

/// Turns the samples of one segment into a spectrum
pub trait SpectralAnalyzer: Send + Sync {
    fn analyze(&self, samples: &[f32], sample_rate: u32) -> Result<Spectrum>;
}

/// Welch PSD estimate
#[derive(Debug, Clone)]
pub struct WelchAnalyzer {
    /// FFT length; one second of audio when unset
    nfft: Option<usize>,
    overlap: f32,
}

impl WelchAnalyzer {
    pub fn new() -> Self {
        Self {
            nfft: None,
            overlap: 0.5,
        }
    }

    pub fn with_nfft(mut self, nfft: usize) -> Self {
        self.nfft = Some(nfft);
        self
    }

    pub fn with_overlap(mut self, overlap: f32) -> Self {
        self.overlap = overlap.clamp(0.0, 0.95);
        self
    }
}

impl Default for WelchAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectralAnalyzer for WelchAnalyzer {
    fn analyze(&self, samples: &[f32], sample_rate: u32) -> Result<Spectrum> {
        if samples.is_empty() {
            anyhow::bail!("No samples to analyze");
        }
        if sample_rate == 0 {
            anyhow::bail!("Sample rate must be > 0");
        }

        let nfft = self.nfft.unwrap_or(sample_rate as usize).max(2);
        let hop = ((nfft as f32 * (1.0 - self.overlap)).round() as usize).max(1);

        // Short input becomes one zero-padded frame
        let num_frames = if samples.len() <= nfft {
            1
        } else {
            (samples.len() - nfft) / hop + 1
        };

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(nfft);
        let window = create_hann_window(nfft);
        let window_power: f32 = window.iter().map(|w| w * w).sum();

        let num_bins = nfft / 2 + 1;
        let mut accum = vec![0.0f64; num_bins];
        let mut frame = vec![Complex::new(0.0f32, 0.0); nfft];

        for frame_idx in 0..num_frames {
            let start = frame_idx * hop;
            let end = (start + nfft).min(samples.len());
            let chunk = &samples[start..end];
            let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;

            for (i, slot) in frame.iter_mut().enumerate() {
                let v = chunk.get(i).map_or(0.0, |s| s - mean);
                *slot = Complex::new(v * window[i], 0.0);
            }
            fft.process(&mut frame);

            for (k, acc) in accum.iter_mut().enumerate() {
                *acc += frame[k].norm_sqr() as f64;
            }
        }

        let scale = 1.0 / (sample_rate as f64 * window_power as f64 * num_frames as f64);
        let psd = accum
            .iter()
            .enumerate()
            .map(|(k, &p)| {
                // one-sided: fold negative frequencies except DC and Nyquist
                let fold = if k == 0 || (nfft % 2 == 0 && k == nfft / 2) {
                    1.0
                } else {
                    2.0
                };
                (p * scale * fold) as f32
            })
            .collect();

        let df = sample_rate as f32 / nfft as f32;
        let frequencies = (0..num_bins).map(|k| k as f32 * df).collect();

        Ok(Spectrum { frequencies, psd })
    }
}

/// Periodic Hann window
fn create_hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            let x = i as f32 / size as f32;
            0.5 * (1.0 - (2.0 * PI * x).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine(freq: f32, amplitude: f32, sample_rate: u32, seconds: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_hann_window() {
        let window = create_hann_window(1024);
        assert_eq!(window.len(), 1024);
        assert_relative_eq!(window[0], 0.0);
        assert_relative_eq!(window[512], 1.0, epsilon = 1e-6);
        assert_relative_eq!(window[256], window[768], epsilon = 1e-6);
    }

    #[test]
    fn test_frequency_axis_defaults_to_one_hertz() {
        let spectrum = WelchAnalyzer::new()
            .analyze(&sine(100.0, 1.0, 1000, 3.0), 1000)
            .unwrap();
        assert_eq!(spectrum.frequencies.len(), 501);
        assert_eq!(spectrum.psd.len(), 501);
        assert_relative_eq!(spectrum.frequencies[1], 1.0);
        assert_relative_eq!(spectrum.frequencies[500], 500.0);
    }

    #[test]
    fn test_sine_peak_and_power() {
        let sample_rate = 8000;
        let samples = sine(1000.0, 0.5, sample_rate, 4.0);
        let spectrum = WelchAnalyzer::new().analyze(&samples, sample_rate).unwrap();

        let peak = spectrum
            .psd
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
            .unwrap();
        assert_relative_eq!(spectrum.frequencies[peak], 1000.0);

        // density scaling: integrating the PSD gives the signal power A²/2
        let df = spectrum.frequencies[1] - spectrum.frequencies[0];
        let power: f32 = spectrum.psd.iter().map(|p| p * df).sum();
        assert_relative_eq!(power, 0.125, max_relative = 0.01);
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let spectrum = WelchAnalyzer::new()
            .analyze(&sine(50.0, 1.0, 1000, 0.3), 1000)
            .unwrap();
        assert_eq!(spectrum.psd.len(), 501);
        assert!(spectrum.psd.iter().all(|p| p.is_finite() && *p >= 0.0));
    }

    #[test]
    fn test_constant_input_has_no_power() {
        let spectrum = WelchAnalyzer::new()
            .with_nfft(256)
            .analyze(&vec![0.25; 2048], 1000)
            .unwrap();
        assert!(spectrum.psd.iter().all(|p| p.abs() < 1e-10));
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(WelchAnalyzer::new().analyze(&[], 1000).is_err());
        assert!(WelchAnalyzer::new().analyze(&[0.0; 10], 0).is_err());
    }
}
