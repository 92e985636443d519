use std::io::Cursor;
use std::process::Stdio;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to run OCR engine: {0}")]
    Engine(String),
}

// ── Recognizer ───────────────────────────────────────────────────────────────

/// Turns an uploaded image into plain text.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<String, OcrError>;
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, OcrError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Runs the `tesseract` binary, feeding it a PNG re-encoding of the upload on stdin.
pub struct TesseractOcr {
    command: String,
    lang: String,
}

impl TesseractOcr {
    pub fn new(command: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            lang: lang.into(),
        }
    }

    async fn run(&self, png: Vec<u8>) -> Result<String, OcrError> {
        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "-l", self.lang.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OcrError::Engine(format!("{}: {}", self.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Engine("stdin not captured".to_string()))?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&png).await?;
            stdin.shutdown().await
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OcrError::Engine(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        writer
            .await
            .map_err(|e| OcrError::Engine(e.to_string()))?
            .map_err(|e| OcrError::Engine(format!("writing image: {}", e)))?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Recognizer for TesseractOcr {
    async fn recognize(&self, image: &[u8]) -> Result<String, OcrError> {
        // Decoding and re-encoding are CPU-bound.
        let bytes = image.to_vec();
        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, OcrError> {
            let decoded = decode_image(&bytes)?;
            let mut png = Vec::new();
            decoded
                .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
                .map_err(|e| OcrError::Engine(format!("re-encoding image: {}", e)))?;
            Ok(png)
        })
        .await
        .map_err(|e| OcrError::Engine(e.to_string()))??;

        tracing::debug!(png_bytes = png.len(), lang = %self.lang, "running tesseract");
        self.run(png).await
    }
}
