use serde::{Deserialize, Serialize};

use crate::content_key::ContentKey;

/// One-time instruction riding along with a single request, e.g. "make it night time"
/// plus a reference image. Never part of the content key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<Modification>,
}

impl GenerationPayload {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            modification: None,
        }
    }
}

/// Emitted on the transport; `id` is the content key used for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: ContentKey,
    pub payload: GenerationPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub id: ContentKey,
    pub success: bool,
    #[serde(default, alias = "resultData")]
    pub result_data: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default, alias = "isVideo")]
    pub is_video: bool,
}

impl GenerationResponse {
    pub fn succeeded(id: ContentKey, result_data: impl Into<String>) -> Self {
        Self {
            id,
            success: true,
            result_data: Some(result_data.into()),
            error: None,
            annotation: None,
            is_video: false,
        }
    }

    pub fn failed(id: ContentKey, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result_data: None,
            error: Some(error.into()),
            annotation: None,
            is_video: false,
        }
    }

    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    pub fn as_video(mut self) -> Self {
        self.is_video = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn request_wire_shape_omits_absent_modification() -> anyhow::Result<()> {
        let request = GenerationRequest {
            id: ContentKey::derive("catgirl"),
            payload: GenerationPayload::prompt("catgirl"),
        };
        let value: Value = serde_json::to_value(&request)?;
        assert_eq!(
            value,
            json!({"id": request.id.as_str(), "payload": {"prompt": "catgirl"}})
        );
        Ok(())
    }

    #[test]
    fn response_accepts_camel_case_fields_from_hosts() -> anyhow::Result<()> {
        let key = ContentKey::derive("catgirl");
        let parsed: GenerationResponse = serde_json::from_value(json!({
            "id": key.as_str(),
            "success": true,
            "resultData": "file:///tmp/a.mp4",
            "isVideo": true,
        }))?;
        assert_eq!(parsed.id, key);
        assert_eq!(parsed.result_data.as_deref(), Some("file:///tmp/a.mp4"));
        assert!(parsed.is_video);
        assert_eq!(parsed.error, None);
        Ok(())
    }
}
