//! Transcript records, the unit of persisted output.

use serde::{Deserialize, Serialize};

/// One word returned by the cloud OCR engine with its polygon.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordBox {
    pub text: String,
    /// Polygon vertices in crop pixel coordinates, clockwise from top-left
    pub vertices: Vec<(i32, i32)>,
}

/// Transcript of a single cropped label.
///
/// Serialised as `{"ID": ..., "text": ...}`; `bounding_boxes` only appears
/// when the cloud engine produced word geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// File name of the crop the text came from
    #[serde(rename = "ID")]
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_boxes: Option<Vec<WordBox>>,
}

impl TranscriptRecord {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            bounding_boxes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialises_with_id_key() {
        let record = TranscriptRecord::new("a_typed_1.jpg", "Berlin 1902");
        let json = serde_json::to_string(&record).unwrap();

        assert_eq!(json, r#"{"ID":"a_typed_1.jpg","text":"Berlin 1902"}"#);
    }

    #[test]
    fn test_bounding_boxes_serialised_when_present() {
        let mut record = TranscriptRecord::new("a.jpg", "Berlin");
        record.bounding_boxes = Some(vec![WordBox {
            text: "Berlin".to_string(),
            vertices: vec![(0, 0), (10, 0), (10, 5), (0, 5)],
        }]);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"bounding_boxes\""));

        let back: TranscriptRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
