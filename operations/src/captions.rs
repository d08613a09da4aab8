//! Caption cue formatting.
//!
//! Turns a timed transcript (word + start/end milliseconds, produced by the
//! speech-to-text engine) into WebVTT. Cues are cut at the configured word
//! count or at silence gaps.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt::Write;

const DEFAULT_WORDS_PER_CUE: usize = 8;

/// A gap this long between words starts a new cue.
const SILENCE_GAP_MS: u64 = 1500;

#[derive(Debug, Deserialize)]
struct Word {
    text: String,
    start_ms: u64,
    end_ms: u64,
}

fn timestamp(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Arguments: `[words_per_cue]`, optional. Payload: JSON array of timed words.
pub fn format_vtt(args: &[String], payload: Option<&str>) -> Result<String> {
    let words_per_cue = match args.first() {
        Some(n) => n.parse::<usize>()?,
        None => DEFAULT_WORDS_PER_CUE,
    };
    if words_per_cue == 0 {
        return Err(anyhow!("words per cue must be positive"));
    }

    let payload = payload.ok_or_else(|| anyhow!("captions require a transcript payload"))?;
    let words: Vec<Word> = serde_json::from_str(payload)?;
    if words.is_empty() {
        return Err(anyhow!("empty transcript"));
    }

    let mut cues: Vec<Vec<&Word>> = vec![vec![]];
    for word in &words {
        let current = cues.last_mut().unwrap();
        let gap = current
            .last()
            .map(|prev: &&Word| word.start_ms.saturating_sub(prev.end_ms))
            .unwrap_or(0);
        if !current.is_empty() && (current.len() >= words_per_cue || gap >= SILENCE_GAP_MS) {
            cues.push(vec![word]);
        } else {
            current.push(word);
        }
    }

    let mut vtt = String::from("WEBVTT\n");
    for cue in &cues {
        let start = cue.first().unwrap().start_ms;
        let end = cue.last().unwrap().end_ms;
        let text: Vec<&str> = cue.iter().map(|w| w.text.as_str()).collect();
        write!(
            vtt,
            "\n{} --> {}\n{}\n",
            timestamp(start),
            timestamp(end),
            text.join(" ")
        )?;
    }
    Ok(vtt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_timestamps() {
        assert_eq!(timestamp(3_723_456), "01:02:03.456");
    }

    #[test]
    fn cuts_cues_at_silence() {
        let payload = r#"[
            {"text":"hello","start_ms":0,"end_ms":400},
            {"text":"world","start_ms":500,"end_ms":900},
            {"text":"again","start_ms":5000,"end_ms":5400}
        ]"#;
        let vtt = format_vtt(&[], Some(payload)).unwrap();
        assert!(vtt.starts_with("WEBVTT\n"));
        assert!(vtt.contains("hello world"));
        assert!(vtt.contains("00:00:05.000 --> 00:00:05.400"));
    }

    #[test]
    fn cuts_cues_at_word_limit() {
        let payload = r#"[
            {"text":"a","start_ms":0,"end_ms":100},
            {"text":"b","start_ms":100,"end_ms":200},
            {"text":"c","start_ms":200,"end_ms":300}
        ]"#;
        let vtt = format_vtt(&["2".to_string()], Some(payload)).unwrap();
        assert!(vtt.contains("a b"));
        assert!(vtt.contains("\nc\n"));
    }
}
