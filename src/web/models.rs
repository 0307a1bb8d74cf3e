// API-specific data models for the web server

use serde::{Deserialize, Serialize};

/// Error envelope returned on every failure path.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error_code: u16,
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_details_omitted_when_none() {
        let body = ErrorBody {
            error_code: 400,
            error_message: "Failed to decode image".into(),
            error_details: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("error_details").is_none());
        assert_eq!(json["error_code"], 400);
    }

    #[test]
    fn test_error_details_serialized_when_present() {
        let body = ErrorBody {
            error_code: 500,
            error_message: "Internal server error".into(),
            error_details: Some("engine thread exited".into()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error_details"], "engine thread exited");
    }
}
