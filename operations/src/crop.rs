//! Black-bar detection.
//!
//! The payload carries a per-column luma profile of a sampled frame (as
//! produced by the capture agent's probe pass). Columns darker than the
//! threshold on both edges are considered pillarbox bars and cropped away.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Luma values below this count as black unless overridden by argument.
const DEFAULT_THRESHOLD: f64 = 24.0;

#[derive(Debug, Deserialize)]
struct Profile {
    width: u32,
    height: u32,
    /// Average luma per column, left to right. Length must equal `width`.
    columns: Vec<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CropGeometry {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

/// Detect pillarbox bars and return the crop geometry as JSON.
///
/// Arguments: `[threshold]`, optional.
pub fn detect(args: &[String], payload: Option<&str>) -> Result<String> {
    let threshold = match args.first() {
        Some(t) => t.parse::<f64>()?,
        None => DEFAULT_THRESHOLD,
    };

    let payload = payload.ok_or_else(|| anyhow!("crop requires a luma profile payload"))?;
    let profile: Profile = serde_json::from_str(payload)?;

    if profile.columns.len() != profile.width as usize {
        return Err(anyhow!(
            "luma profile has {} columns for width {}",
            profile.columns.len(),
            profile.width
        ));
    }

    let left = profile
        .columns
        .iter()
        .position(|&l| l > threshold)
        .unwrap_or(profile.columns.len());
    let right = profile
        .columns
        .iter()
        .rposition(|&l| l > threshold)
        .map(|i| i + 1)
        .unwrap_or(0);

    if left >= right {
        return Err(anyhow!("frame is entirely black at threshold {}", threshold));
    }

    let geometry = CropGeometry {
        width: (right - left) as u32,
        height: profile.height,
        x: left as u32,
        y: 0,
    };

    Ok(serde_json::to_string(&geometry)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(columns: Vec<f64>) -> String {
        format!(
            r#"{{"width":{},"height":90,"columns":{:?}}}"#,
            columns.len(),
            columns
        )
    }

    #[test]
    fn strips_pillarbox_bars() {
        let payload = profile(vec![0.0, 2.0, 80.0, 120.0, 95.0, 3.0]);
        let out = detect(&[], Some(&payload)).unwrap();
        let geo: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(geo["x"], 2);
        assert_eq!(geo["width"], 3);
        assert_eq!(geo["height"], 90);
    }

    #[test]
    fn all_black_frame_is_an_error() {
        let payload = profile(vec![1.0, 1.0, 1.0]);
        assert!(detect(&[], Some(&payload)).is_err());
    }

    #[test]
    fn threshold_argument_overrides_default() {
        let payload = profile(vec![30.0, 90.0, 30.0]);
        // Default threshold keeps every column.
        let wide: serde_json::Value =
            serde_json::from_str(&detect(&[], Some(&payload)).unwrap()).unwrap();
        assert_eq!(wide["width"], 3);
        // A higher threshold treats the 30.0 columns as bars.
        let narrow: serde_json::Value =
            serde_json::from_str(&detect(&["50".to_string()], Some(&payload)).unwrap()).unwrap();
        assert_eq!(narrow["width"], 1);
        assert_eq!(narrow["x"], 1);
    }
}
