use std::path::Path;
use std::sync::Arc;

use crate::models::ExampleData;

const BUILTIN_INVOICE_EXAMPLES: &str = include_str!("../data/invoice_examples.json");

#[derive(Debug, thiserror::Error)]
pub enum FewShotError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid example set: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("example set is empty")]
    Empty,
}

/// Loads the example set from `path`, or the built-in invoice examples when no path is given.
pub fn load(path: Option<&Path>) -> Result<Arc<[ExampleData]>, FewShotError> {
    let examples = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| FewShotError::Read {
                path: path.display().to_string(),
                source,
            })?;
            parse(&raw)?
        }
        None => builtin()?,
    };
    tracing::info!(count = examples.len(), "loaded few-shot examples");
    Ok(examples.into())
}

pub fn builtin() -> Result<Vec<ExampleData>, FewShotError> {
    parse(BUILTIN_INVOICE_EXAMPLES)
}

fn parse(raw: &str) -> Result<Vec<ExampleData>, FewShotError> {
    let examples: Vec<ExampleData> = serde_json::from_str(raw)?;
    if examples.is_empty() {
        return Err(FewShotError::Empty);
    }
    Ok(examples)
}
