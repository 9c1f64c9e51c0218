//! Google Cloud Vision text detection over its REST interface.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::engine::{OcrEngine, OcrOutput};
use crate::error::PipelineError;
use crate::transcript::WordBox;

pub const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com/v1/images:annotate";

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextAnnotation {
    #[serde(default)]
    description: String,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

/// Zero coordinates are omitted from the JSON.
#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    message: String,
}

/// Turns an `images:annotate` response body into text and word boxes.
///
/// The first annotation is the full text; the rest are single words.
pub fn parse_annotate_response(body: &str) -> Result<OcrOutput> {
    let parsed: AnnotateResponse =
        serde_json::from_str(body).context("Failed to parse Vision API response")?;
    let response = parsed
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Vision API response has no entries"))?;

    if let Some(status) = response.error {
        if !status.message.is_empty() {
            return Err(PipelineError::RemoteOcr(status.message).into());
        }
    }

    let mut annotations = response.text_annotations.into_iter();
    let Some(full) = annotations.next() else {
        return Ok(OcrOutput::default());
    };

    let words = annotations
        .map(|a| WordBox {
            text: a.description,
            vertices: a
                .bounding_poly
                .map(|poly| poly.vertices.iter().map(|v| (v.x, v.y)).collect())
                .unwrap_or_default(),
        })
        .collect();

    Ok(OcrOutput {
        text: full.description,
        bounding_boxes: Some(words),
    })
}

/// Cloud engine. Does its own preprocessing, so it receives raw crops.
pub struct VisionEngine {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl VisionEngine {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }

    fn request_body(image: &DynamicImage) -> Result<serde_json::Value> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("Failed to encode image for Vision API")?;

        Ok(json!({
            "requests": [{
                "image": { "content": BASE64.encode(&bytes) },
                "features": [{ "type": "TEXT_DETECTION" }]
            }]
        }))
    }
}

impl OcrEngine for VisionEngine {
    fn name(&self) -> &'static str {
        "vision"
    }

    fn preprocesses_internally(&self) -> bool {
        true
    }

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutput> {
        let body = Self::request_body(image)?;

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .header("User-Agent", "label-transcriber")
            .json(&body)
            .send()
            .context("Vision API request failed")?;

        let status = response.status();
        let text = response.text().context("Failed to read Vision API response")?;
        debug!(%status, bytes = text.len(), "Vision API response");

        // Error bodies still carry a message worth surfacing
        match parse_annotate_response(&text) {
            Err(e) if !status.is_success() => Err(anyhow!("Vision API HTTP {}: {}", status, e)),
            result => result,
        }
    }
}
