//! Calibration
//!
//! Converts aggregated PSD rows to dB and adds the hydrophone sensitivity,
//! then cuts the frequency axis down to the requested range.

use crate::aggregator::DayProduct;
use crate::cache::DownloadCache;
use crate::config::CalibrationConfig;
use crate::error::{PbpError, Result};
use crate::storage_backend::StoreRegistry;
use pbp_format::CalibrationInfo;
use serde::Deserialize;
use std::io::Read;

/// Sensitivity correction in dB
#[derive(Debug, Clone, PartialEq)]
pub enum Sensitivity {
    /// Frequency-dependent curve, frequencies ascending
    Curve {
        source: String,
        frequencies: Vec<f64>,
        values: Vec<f64>,
    },
    Flat(f64),
}

#[derive(Deserialize)]
struct CurveFile {
    frequency: Vec<f64>,
    sensitivity: Vec<f64>,
}

impl Sensitivity {
    /// Pick the configured source. A curve wins over a flat value; having
    /// neither is a configuration error.
    pub fn from_sources(
        config: &CalibrationConfig,
        stores: &StoreRegistry,
        cache: &DownloadCache,
    ) -> Result<Self> {
        match (&config.sensitivity_uri, config.sensitivity_flat_value) {
            (Some(uri), flat) => {
                if flat.is_some() {
                    log::warn!("Both sensitivity sources given; using the curve {}", uri);
                }
                Self::load_curve(uri, stores, cache)
            }
            (None, Some(value)) => Ok(Sensitivity::Flat(value)),
            (None, None) => Err(PbpError::config(
                "one of sensitivity_uri or sensitivity_flat_value is required",
            )),
        }
    }

    /// Load a `{"frequency": [...], "sensitivity": [...]}` curve
    pub fn load_curve(uri: &str, stores: &StoreRegistry, cache: &DownloadCache) -> Result<Self> {
        let location = stores.resolve(uri)?;
        let mut localized = cache.localize(stores, &location)?;
        let mut contents = String::new();
        let read = localized.file.read_to_string(&mut contents);
        cache.release(localized);
        read.map_err(|e| PbpError::config(format!("cannot read sensitivity curve {uri}: {e}")))?;

        let curve = Self::parse_curve(uri, &contents)?;
        log::info!("Loaded sensitivity curve {} ({} points)", uri, curve.len());
        Ok(curve)
    }

    pub fn parse_curve(source: &str, contents: &str) -> Result<Self> {
        let file: CurveFile = serde_json::from_str(contents)
            .map_err(|e| PbpError::config(format!("invalid sensitivity curve {source}: {e}")))?;
        if file.frequency.is_empty() || file.frequency.len() != file.sensitivity.len() {
            return Err(PbpError::config(format!(
                "sensitivity curve {source} has {} frequencies and {} values",
                file.frequency.len(),
                file.sensitivity.len()
            )));
        }

        let mut points: Vec<(f64, f64)> = file.frequency.into_iter().zip(file.sensitivity).collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (frequencies, values) = points.into_iter().unzip();
        Ok(Sensitivity::Curve {
            source: source.to_string(),
            frequencies,
            values,
        })
    }

    fn len(&self) -> usize {
        match self {
            Sensitivity::Curve { frequencies, .. } => frequencies.len(),
            Sensitivity::Flat(_) => 1,
        }
    }

    /// Correction at `frequency`; NaN outside the curve's span
    pub fn at(&self, frequency: f64) -> f64 {
        match self {
            Sensitivity::Flat(value) => *value,
            Sensitivity::Curve {
                frequencies,
                values,
                ..
            } => interpolate(frequencies, values, frequency),
        }
    }

    pub fn info(&self) -> CalibrationInfo {
        match self {
            Sensitivity::Curve { source, .. } => CalibrationInfo::Curve {
                source: source.clone(),
            },
            Sensitivity::Flat(value) => CalibrationInfo::Flat { value: *value },
        }
    }
}

fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return f64::NAN;
    };
    if !(first..=last).contains(&x) {
        return f64::NAN;
    }
    let i = xs.partition_point(|&v| v < x);
    if xs[i] == x {
        return ys[i];
    }
    let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// A day product after calibration
#[derive(Debug, Clone)]
pub struct CalibratedDay {
    pub product: DayProduct,
    pub calibration: CalibrationInfo,
    /// Correction per remaining frequency; empty for a flat value
    pub sensitivity: Vec<f32>,
    pub subset_to: Option<(f32, f32)>,
}

pub struct CalibrationApplier {
    sensitivity: Sensitivity,
    subset_to: Option<(f32, f32)>,
}

impl CalibrationApplier {
    pub fn new(sensitivity: Sensitivity, subset_to: Option<(f32, f32)>) -> Self {
        Self {
            sensitivity,
            subset_to,
        }
    }

    pub fn sensitivity(&self) -> &Sensitivity {
        &self.sensitivity
    }

    /// Convert rows to dB, add the sensitivity and keep `[lower, upper)`
    pub fn calibrate(&self, mut product: DayProduct) -> CalibratedDay {
        let correction: Vec<f32> = product
            .frequencies
            .iter()
            .map(|&f| self.sensitivity.at(f as f64) as f32)
            .collect();

        for row in product.rows.iter_mut().flatten() {
            for (v, c) in row.iter_mut().zip(&correction) {
                *v = 10.0 * v.log10() + c;
            }
        }

        let keep: Vec<usize> = match self.subset_to {
            Some((lower, upper)) => product
                .frequencies
                .iter()
                .enumerate()
                .filter(|&(_, &f)| f >= lower && f < upper)
                .map(|(i, _)| i)
                .collect(),
            None => (0..product.frequencies.len()).collect(),
        };

        if keep.len() != product.frequencies.len() {
            log::debug!(
                "Subsetting {} frequencies to {} in {:?}",
                product.frequencies.len(),
                keep.len(),
                self.subset_to
            );
            let pick = |values: &[f32]| keep.iter().map(|&i| values[i]).collect::<Vec<f32>>();
            product.frequencies = pick(&product.frequencies);
            for row in product.rows.iter_mut().flatten() {
                *row = pick(row.as_slice());
            }
        }

        let sensitivity = match self.sensitivity {
            Sensitivity::Curve { .. } => keep.iter().map(|&i| correction[i]).collect(),
            Sensitivity::Flat(_) => Vec::new(),
        };

        CalibratedDay {
            product,
            calibration: self.sensitivity.info(),
            sensitivity,
            subset_to: self.subset_to,
        }
    }
}
