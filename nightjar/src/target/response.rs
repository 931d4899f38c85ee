// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - responses from the target task.

use alloc::string::{String, ToString};

use crate::error::NightjarError;

/// Outcome of a target command, shaped for the JSON surface: every
/// application-level result renders as `{success, message, code?}` plus
/// whatever `data` the operation produced.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(flatten)]
    pub data: Option<serde_json::Value>,
}

impl Response {
    pub fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            code: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<NightjarError> for Response {
    fn from(error: NightjarError) -> Self {
        Self {
            success: false,
            message: error.message(),
            code: Some(error.code()),
            data: None,
        }
    }
}

impl From<Result<Response, NightjarError>> for Response {
    fn from(result: Result<Response, NightjarError>) -> Self {
        result.unwrap_or_else(Response::from)
    }
}
