use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub class: String,
    pub text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[cfg(test)]
impl Extraction {
    pub fn new(class: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            text: text.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A worked document/extractions pair sent to the model as few-shot guidance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExampleData {
    pub text: String,
    pub extractions: Vec<Extraction>,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub extracted_text: String,
    pub structured_data: Vec<Extraction>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
