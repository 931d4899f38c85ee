// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

//! nightjar - HTTP response model.
//!
//! Request heads are parsed with `httparse`; responses are assembled here
//! and written straight to the socket.  The control surface is almost
//! entirely JSON: application-level failures ride in a 200 body as
//! `{success: false, message, code}`, and only malformed requests get a
//! 400.

use alloc::format;
use alloc::string::{String, ToString};
use core::fmt;
use embedded_io_async::Write;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub(crate) mod server;

pub(crate) use server::start;

/// Number of tasks in the web task pool.
pub(crate) const WEB_TASK_POOL_SIZE: usize = 2;

/// Port for the HTTP server
pub(crate) const HTTPD_PORT: u16 = 80;

// Buffer sizes for the HTTP server tasks
pub(crate) const HTTPD_TASK_TCP_RX_BUF_SIZE: usize = 4096;
pub(crate) const HTTPD_TASK_TCP_TX_BUF_SIZE: usize = 4096;
pub(crate) const HTTPD_HEADER_BUF_SIZE: usize = 2048;
pub(crate) const HTTPD_MAX_HEADERS: usize = 24;

/// Supported HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Method {
    Get,
    Post,
}

impl Method {
    pub fn from_str(method: &str) -> Option<Method> {
        match method {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ContentType {
    Html,
    Json,
    Text,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "text/html",
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    NotFound = 404,
    MethodNotAllowed = 405,
    TooLarge = 413,
    InternalServerError = 500,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "200 OK",
            Self::BadRequest => "400 Bad Request",
            Self::NotFound => "404 Not Found",
            Self::MethodNotAllowed => "405 Method Not Allowed",
            Self::TooLarge => "413 Payload Too Large",
            Self::InternalServerError => "500 Internal Server Error",
        }
    }
}

/// A response ready to write to the socket.
#[derive(Debug, Clone)]
pub(crate) struct Response {
    pub status_code: StatusCode,
    pub content_type: ContentType,
    pub body: String,
}

impl Response {
    pub fn json<T: serde::Serialize>(data: &T) -> Self {
        let body = serde_json::to_string(data)
            .unwrap_or_else(|_| "{\"success\":false,\"message\":\"serialize\"}".to_string());
        Self {
            status_code: StatusCode::Ok,
            content_type: ContentType::Json,
            body,
        }
    }

    pub fn text(body: &str) -> Self {
        Self {
            status_code: StatusCode::Ok,
            content_type: ContentType::Text,
            body: body.to_string(),
        }
    }

    pub fn html(body: String) -> Self {
        Self {
            status_code: StatusCode::Ok,
            content_type: ContentType::Html,
            body,
        }
    }

    /// A `{success: false, ...}` body on a 200, for application-level
    /// failures.
    pub fn api_error(message: &str, code: &str) -> Self {
        Self::json(&serde_json::json!({
            "success": false,
            "message": message,
            "code": code,
        }))
    }

    /// Non-200 statuses, for malformed requests and unknown paths.
    pub fn status(status_code: StatusCode) -> Self {
        Self {
            status_code,
            content_type: ContentType::Text,
            body: status_code.as_str().to_string(),
        }
    }

    pub async fn write_to(
        &self,
        socket: &mut embassy_net::tcp::TcpSocket<'_>,
    ) -> Result<(), embassy_net::tcp::Error> {
        let head = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: {}\r\nCache-Control: no-store\r\n\r\n",
            self.status_code.as_str(),
            self.body.len(),
            self.content_type.as_str(),
        );
        socket.write_all(head.as_bytes()).await?;
        socket.write_all(self.body.as_bytes()).await?;
        Ok(())
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status_code.as_str())
    }
}
