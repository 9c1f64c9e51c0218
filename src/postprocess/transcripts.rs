//! Sorting a transcript collection into NURIs, empty transcripts and
//! plausible text, and cleaning the plausible part.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::info;

use crate::pipeline::output::save_json;
use crate::transcript::TranscriptRecord;

/// A lone non-ASCII character between spaces.
const NON_ASCII: &str = r" [^\x00-\x7F] ";
/// Two or more symbols in a row.
const NON_ALPHA_NUM: &str = r"[^a-zA-Z\d\s]{2,}";
const PIPE: &str = r"[|]";

/// Transcripts with a shorter mean word length are treated as noise.
const MIN_MEAN_TOKEN_LENGTH: f64 = 2.0;

pub const NURIS_FILE: &str = "nuris.csv";
pub const EMPTY_FILE: &str = "empty_transcripts.csv";
pub const PLAUSIBLE_FILE: &str = "plausible_transcripts.json";
pub const CORRECTED_FILE: &str = "corrected_transcripts.json";

/// Transcripts grouped by kind. Implausible transcripts are dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptSplit {
    pub nuris: Vec<TranscriptRecord>,
    pub empty: Vec<TranscriptRecord>,
    pub plausible: Vec<TranscriptRecord>,
    /// Same order as `plausible`, with text cleaned
    pub cleaned: Vec<TranscriptRecord>,
}

pub struct TranscriptCleaner {
    non_ascii: Regex,
    non_alpha_num: Regex,
    pipe: Regex,
}

impl TranscriptCleaner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            non_ascii: Regex::new(NON_ASCII)?,
            non_alpha_num: Regex::new(NON_ALPHA_NUM)?,
            pipe: Regex::new(PIPE)?,
        })
    }

    /// Drops isolated non-ASCII characters, symbol runs and pipes.
    pub fn clean(&self, text: &str) -> String {
        let text = self.non_ascii.replace_all(text, " ");
        let text = self.non_alpha_num.replace_all(&text, "");
        self.pipe.replace_all(&text, "").into_owned()
    }

    pub fn split(&self, records: &[TranscriptRecord]) -> TranscriptSplit {
        let mut split = TranscriptSplit::default();

        for record in records {
            if is_nuri(&record.text) {
                split.nuris.push(record.clone());
            } else if record.text.is_empty() {
                split.empty.push(record.clone());
            } else if is_plausible(&record.text) {
                split.plausible.push(record.clone());
                split
                    .cleaned
                    .push(TranscriptRecord::new(record.id.clone(), self.clean(&record.text)));
            }
        }

        split
    }
}

pub fn is_nuri(text: &str) -> bool {
    text.starts_with("http")
}

/// Mean length of word tokens, punctuation tokens excluded, is at least 2.
pub fn is_plausible(text: &str) -> bool {
    let tokens: Vec<&str> = tokenize(text)
        .into_iter()
        .filter(|t| !is_punctuation(t))
        .collect();
    if tokens.is_empty() {
        return false;
    }

    let total: usize = tokens.iter().map(|t| t.chars().count()).sum();
    total as f64 / tokens.len() as f64 >= MIN_MEAN_TOKEN_LENGTH
}

fn is_punctuation(token: &str) -> bool {
    let mut chars = token.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_punctuation())
}

/// Whitespace split, with ASCII punctuation split off as single tokens.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    for chunk in text.split_whitespace() {
        let mut start = 0;
        for (i, c) in chunk.char_indices() {
            if c.is_ascii_punctuation() {
                if start < i {
                    tokens.push(&chunk[start..i]);
                }
                tokens.push(&chunk[i..i + 1]);
                start = i + 1;
            }
        }
        if start < chunk.len() {
            tokens.push(&chunk[start..]);
        }
    }
    tokens
}

/// `ID,text` CSV with standard quoting.
fn write_csv(path: &Path, records: &[TranscriptRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .context(format!("Failed to create CSV file: {}", path.display()))?;
    writer
        .write_record(["ID", "text"])
        .context("Failed to write CSV header")?;
    for r in records {
        writer
            .write_record([r.id.as_str(), r.text.as_str()])
            .context("Failed to write CSV row")?;
    }
    writer.flush().context("Failed to flush CSV file")?;
    Ok(())
}

/// Writes the four post-processing outputs into `out_dir`.
pub fn write_split(split: &TranscriptSplit, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .context(format!("Failed to create directory: {}", out_dir.display()))?;

    write_csv(&out_dir.join(NURIS_FILE), &split.nuris)?;
    write_csv(&out_dir.join(EMPTY_FILE), &split.empty)?;
    save_json(&out_dir.join(PLAUSIBLE_FILE), &split.plausible)?;
    save_json(&out_dir.join(CORRECTED_FILE), &split.cleaned)?;

    info!(
        nuris = split.nuris.len(),
        empty = split.empty.len(),
        plausible = split.plausible.len(),
        dir = %out_dir.display(),
        "Wrote post-processed transcripts"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::output::load_json;
    use tempfile::tempdir;

    fn records() -> Vec<TranscriptRecord> {
        vec![
            TranscriptRecord::new("coll.mfn-berlin.de_u_43acfb_label_box_2.jpg", "http://coll.mfn-berlin.de/u/43acfb"),
            TranscriptRecord::new("a_typed_1.jpg", ""),
            TranscriptRecord::new("b_typed_1.jpg", "Berlin || leg. Müller 1902 ~~"),
            TranscriptRecord::new("c_typed_1.jpg", "a . b , c"),
            TranscriptRecord::new("d_typed_1.jpg", "CASENTO 56396"),
        ]
    }

    #[test]
    fn test_split_by_kind() {
        let split = TranscriptCleaner::new().unwrap().split(&records());

        assert_eq!(split.nuris.len(), 1);
        assert_eq!(split.empty.len(), 1);
        let plausible: Vec<&str> = split.plausible.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(plausible, vec!["b_typed_1.jpg", "d_typed_1.jpg"]);
        assert_eq!(split.cleaned.len(), split.plausible.len());
    }

    #[test]
    fn test_clean_transcript() {
        let cleaner = TranscriptCleaner::new().unwrap();

        assert_eq!(cleaner.clean("Berlin || leg. Müller 1902 ~~"), "Berlin  leg. Müller 1902 ");
        assert_eq!(cleaner.clean("Fundort ä Berlin"), "Fundort Berlin");
        assert_eq!(cleaner.clean("a|b"), "ab");
    }

    #[test]
    fn test_plausibility() {
        assert!(is_plausible("Berlin 1902"));
        assert!(!is_plausible("a b c"));
        assert!(!is_plausible(". , ;"));
        assert!(is_plausible("leg. Müller"));
    }

    #[test]
    fn test_tokenize_splits_punctuation() {
        assert_eq!(tokenize("leg.Müller, 1902"), vec!["leg", ".", "Müller", ",", "1902"]);
    }

    #[test]
    fn test_nuri_is_not_treated_as_plain_text() {
        assert!(is_nuri("http://coll.mfn-berlin.de/u/43acfb"));
        assert!(!is_nuri("CASENTO 56396"));
    }

    #[test]
    fn test_write_split() {
        let dir = tempdir().unwrap();
        let split = TranscriptCleaner::new().unwrap().split(&records());

        write_split(&split, dir.path()).unwrap();

        let nuris = std::fs::read_to_string(dir.path().join(NURIS_FILE)).unwrap();
        assert_eq!(
            nuris.lines().nth(1).unwrap(),
            "coll.mfn-berlin.de_u_43acfb_label_box_2.jpg,http://coll.mfn-berlin.de/u/43acfb"
        );
        let corrected: Vec<TranscriptRecord> = load_json(&dir.path().join(CORRECTED_FILE)).unwrap();
        assert_eq!(corrected[0].text, "Berlin  leg. Müller 1902 ");
    }

    #[test]
    fn test_csv_quotes_text_with_commas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let rows = vec![TranscriptRecord::new("e_typed_1.jpg", "Berlin, leg. \"Müller\"")];

        write_csv(&path, &rows).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().nth(1).unwrap(), "e_typed_1.jpg,\"Berlin, leg. \"\"Müller\"\"\"");
    }
}
