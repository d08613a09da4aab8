//! Waveform peak extraction.
//!
//! Reduces a PCM sample array to per-bucket min/max peak pairs, which is what
//! the player UI draws. The sample array arrives as the job payload.

use anyhow::{anyhow, Result};
use serde::Serialize;

const DEFAULT_BUCKETS: usize = 200;

#[derive(Debug, Serialize)]
struct Peaks {
    buckets: usize,
    min: Vec<f32>,
    max: Vec<f32>,
}

/// Arguments: `[buckets]`, optional. Payload: JSON array of samples in -1..1.
pub fn render(args: &[String], payload: Option<&str>) -> Result<String> {
    let buckets = match args.first() {
        Some(b) => b.parse::<usize>()?,
        None => DEFAULT_BUCKETS,
    };
    if buckets == 0 {
        return Err(anyhow!("bucket count must be positive"));
    }

    let payload = payload.ok_or_else(|| anyhow!("waveform requires a sample payload"))?;
    let samples: Vec<f32> = serde_json::from_str(payload)?;
    if samples.is_empty() {
        return Err(anyhow!("empty sample array"));
    }

    let buckets = buckets.min(samples.len());
    let chunk = samples.len().div_ceil(buckets);

    let mut min = Vec::with_capacity(buckets);
    let mut max = Vec::with_capacity(buckets);
    for window in samples.chunks(chunk) {
        let lo = window.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = window.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        min.push(lo);
        max.push(hi);
    }

    let peaks = Peaks {
        buckets: min.len(),
        min,
        max,
    };
    Ok(serde_json::to_string(&peaks)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peaks_cover_the_extremes() {
        let payload = "[0.0, 0.5, -0.5, 1.0, -1.0, 0.25, 0.0, -0.25]";
        let out = render(&["2".to_string()], Some(payload)).unwrap();
        let peaks: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(peaks["buckets"], 2);
        assert_eq!(peaks["min"][0], -0.5);
        assert_eq!(peaks["max"][1], 0.25);
        assert_eq!(peaks["min"][1], -1.0);
    }

    #[test]
    fn more_buckets_than_samples_collapses() {
        let out = render(&["50".to_string()], Some("[0.1, -0.1]")).unwrap();
        let peaks: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(peaks["buckets"], 2);
    }

    #[test]
    fn rejects_missing_payload() {
        assert!(render(&[], None).is_err());
    }
}
