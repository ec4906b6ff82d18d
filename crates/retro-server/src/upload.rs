use std::collections::HashMap;

use axum::extract::Multipart;
use retro_types::RetroError;
use serde_json::Value;

use crate::ApiError;

pub const RULES_PART: &str = "rules_file";
pub const SINK_PART: &str = "sink_file";
pub const PATHWAYS_PART: &str = "rp2_pathways";
const DATA_PART: &str = "data";

/// A parsed multipart upload.
#[derive(Debug, Default)]
pub struct Upload {
    /// Parameters from the `data` part, an empty object when absent.
    pub data: Value,
    files: HashMap<String, Vec<u8>>,
}

impl Upload {
    pub async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut upload = Upload {
            data: Value::Object(Default::default()),
            files: HashMap::new(),
        };
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| RetroError::BadRequest(format!("malformed upload: {e}")))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| RetroError::BadRequest(format!("cannot read part '{name}': {e}")))?;
            if name == DATA_PART {
                upload.data = serde_json::from_slice(&bytes)
                    .map_err(|e| RetroError::BadRequest(format!("'data' is not JSON: {e}")))?;
            } else if !bytes.is_empty() {
                tracing::debug!(part = %name, bytes = bytes.len(), "received file");
                upload.files.insert(name, bytes.to_vec());
            }
        }
        Ok(upload)
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn take_file(&mut self, name: &str) -> Option<Vec<u8>> {
        self.files.remove(name)
    }

    pub fn require_file(&mut self, name: &str) -> Result<Vec<u8>, RetroError> {
        self.take_file(name)
            .ok_or_else(|| RetroError::MissingParameter(name.to_string()))
    }
}
