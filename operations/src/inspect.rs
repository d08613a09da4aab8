//! Media manifest inspection.
//!
//! Summarizes a capture manifest: track count per flavor, total duration and
//! whether the tracks line up. Probing the actual container is done by an
//! external inspector; this handler works on its JSON output.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct Track {
    flavor: String,
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    tracks: Vec<Track>,
}

#[derive(Debug, Serialize)]
struct Summary {
    tracks: usize,
    flavors: Vec<String>,
    duration_ms: u64,
    duration_mismatch: bool,
}

/// Tracks of one recording may drift apart by this much before we flag it.
const DRIFT_TOLERANCE_MS: u64 = 500;

pub fn inspect(_args: &[String], payload: Option<&str>) -> Result<String> {
    let payload = payload.ok_or_else(|| anyhow!("inspect requires a manifest payload"))?;
    let manifest: Manifest = serde_json::from_str(payload)?;
    if manifest.tracks.is_empty() {
        return Err(anyhow!("manifest contains no tracks"));
    }

    let longest = manifest.tracks.iter().map(|t| t.duration_ms).max().unwrap();
    let shortest = manifest.tracks.iter().map(|t| t.duration_ms).min().unwrap();

    let mut flavors: Vec<String> = manifest.tracks.iter().map(|t| t.flavor.clone()).collect();
    flavors.sort();
    flavors.dedup();

    let summary = Summary {
        tracks: manifest.tracks.len(),
        flavors,
        duration_ms: longest,
        duration_mismatch: longest - shortest > DRIFT_TOLERANCE_MS,
    };
    Ok(serde_json::to_string(&summary)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarizes_tracks() {
        let payload = r#"{"tracks":[
            {"flavor":"presenter/source","duration_ms":60000},
            {"flavor":"presentation/source","duration_ms":60100}
        ]}"#;
        let out = inspect(&[], Some(payload)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["tracks"], 2);
        assert_eq!(v["duration_ms"], 60100);
        assert_eq!(v["duration_mismatch"], false);
    }

    #[test]
    fn flags_drifting_tracks() {
        let payload = r#"{"tracks":[
            {"flavor":"presenter/source","duration_ms":60000},
            {"flavor":"presentation/source","duration_ms":63000}
        ]}"#;
        let v: serde_json::Value =
            serde_json::from_str(&inspect(&[], Some(payload)).unwrap()).unwrap();
        assert_eq!(v["duration_mismatch"], true);
    }

    #[test]
    fn empty_manifest_is_an_error() {
        assert!(inspect(&[], Some(r#"{"tracks":[]}"#)).is_err());
    }
}
