use std::sync::Arc;

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

mod config;
mod extract;
mod few_shot;
mod models;
mod ocr;

use config::Config;
use extract::{ExtractionServiceError, Extractor, GeminiExtractor};
use models::{ErrorBody, ExampleData, ExtractResponse};
use ocr::{OcrError, Recognizer, TesseractOcr};

#[derive(Clone)]
struct AppState {
    recognizer: Arc<dyn Recognizer>,
    extractor: Arc<dyn Extractor>,
    examples: Arc<[ExampleData]>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tracing::info!(?config, "configuration loaded");

    let state = AppState {
        recognizer: Arc::new(TesseractOcr::new(&config.tesseract_cmd, &config.tesseract_lang)),
        extractor: Arc::new(GeminiExtractor::new(&config)?),
        examples: few_shot::load(config.few_shot_path.as_deref())?,
    };

    let app = app(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn app(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract_endpoint))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Error response ───────────────────────────────────────────────────────────

#[derive(Debug)]
enum ApiError {
    Validation(&'static str),
    PayloadTooLarge,
    Decode(String),
    ExtractionService(ExtractionServiceError),
    Internal(String),
}

impl From<OcrError> for ApiError {
    fn from(e: OcrError) -> Self {
        match e {
            OcrError::Decode(e) => ApiError::Decode(e.to_string()),
            OcrError::Engine(msg) => ApiError::Internal(format!("OCR engine: {}", msg)),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            tracing::info!(error = %e, "upload exceeds body limit");
            ApiError::PayloadTooLarge
        } else {
            tracing::debug!(error = %e, "malformed multipart body");
            ApiError::Validation("Invalid multipart request")
        }
    }
}

impl From<ExtractionServiceError> for ApiError {
    fn from(e: ExtractionServiceError) -> Self {
        ApiError::ExtractionService(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, *msg),
            ApiError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "Uploaded file is too large"),
            ApiError::Decode(cause) => {
                tracing::info!(%cause, "rejected undecodable upload");
                (StatusCode::BAD_REQUEST, "Uploaded file is not a decodable image")
            }
            ApiError::ExtractionService(cause) => {
                tracing::error!(%cause, "extraction service failed");
                (StatusCode::BAD_GATEWAY, "Extraction service failed")
            }
            ApiError::Internal(cause) => {
                tracing::error!(%cause, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        let body = ErrorBody {
            error: message.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ── POST /extract ────────────────────────────────────────────────────────────

async fn extract_endpoint(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ExtractResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        tracing::debug!(error = %e, "not a multipart request");
        ApiError::Validation("Invalid multipart request")
    })?;

    let mut image = None;
    let mut prompt = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            // Only file parts count as an upload.
            Some("image") if field.file_name().is_some() => {
                image = Some(field.bytes().await?);
            }
            Some("prompt") => {
                prompt = Some(field.text().await?);
            }
            _ => {}
        }
    }

    // Both fields are checked before any OCR or model work.
    let image = image
        .filter(|b| !b.is_empty())
        .ok_or(ApiError::Validation("No image file uploaded"))?;
    let prompt = prompt
        .filter(|p| !p.is_empty())
        .ok_or(ApiError::Validation("Prompt is required"))?;

    tracing::info!(image_bytes = image.len(), prompt_len = prompt.len(), "extract request");

    let raw_text = state.recognizer.recognize(&image).await?;
    let extracted_text = raw_text.trim().to_string();

    if extracted_text.is_empty() {
        tracing::info!("OCR found no text, skipping extraction");
        return Ok(Json(ExtractResponse {
            extracted_text,
            structured_data: Vec::new(),
        }));
    }

    let prompt = extract::dedent(&prompt);
    let structured_data = state
        .extractor
        .extract(&extracted_text, &prompt, &state.examples)
        .await
        .map_err(|e| {
            tracing::warn!(ocr_text = %extracted_text, "extraction failed after OCR");
            ApiError::from(e)
        })?;

    tracing::info!(
        text_len = extracted_text.len(),
        extractions = structured_data.len(),
        "extract request completed"
    );

    Ok(Json(ExtractResponse {
        extracted_text,
        structured_data,
    }))
}
