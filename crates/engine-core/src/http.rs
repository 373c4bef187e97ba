//! Blocking HTTP client used by the `http` library
//!
//! Calls block the session thread for at most the configured timeout.
//! Non-2xx answers are responses, not errors.

use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Content type sent with a body when the script names none
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// HTTP errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("Unsupported HTTP method '{0}'")]
    UnsupportedMethod(String),
    #[error("HTTP {method} {url}: {detail}")]
    Request {
        method: &'static str,
        url: String,
        detail: String,
    },
    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(u64),
    #[error("Reading response body: {0}")]
    Body(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn parse(name: &str) -> Result<Self, HttpError> {
        match name.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            _ => Err(HttpError::UnsupportedMethod(name.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    fn sends_body(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: Method,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::Get,
            body: Vec::new(),
            content_type: None,
            headers: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::Post,
            body: body.into(),
            ..Self::get(url)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_message: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_ms: u64,
    pub max_body_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

pub struct HttpClient {
    agent: ureq::Agent,
    max_body_bytes: u64,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Self {
        let agent_config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_millis(config.timeout_ms)))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(agent_config),
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = request.url.as_str();
        let method = request.method;
        tracing::debug!(method = method.as_str(), %url, "HTTP request");

        let result = if method.sends_body() {
            let builder = match method {
                Method::Put => self.agent.put(url),
                Method::Patch => self.agent.patch(url),
                _ => self.agent.post(url),
            };
            let mut builder = with_headers(builder, &request.headers);
            if !has_header(&request.headers, "content-type") {
                let content_type = request
                    .content_type
                    .as_deref()
                    .unwrap_or(DEFAULT_CONTENT_TYPE);
                builder = builder.header("Content-Type", content_type);
            }
            builder.send(&request.body[..])
        } else {
            let builder = match method {
                Method::Delete => self.agent.delete(url),
                Method::Head => self.agent.head(url),
                Method::Options => self.agent.options(url),
                _ => self.agent.get(url),
            };
            with_headers(builder, &request.headers).call()
        };

        let response = result.map_err(|e| HttpError::Request {
            method: method.as_str(),
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        response
            .into_body()
            .into_reader()
            .take(self.max_body_bytes + 1)
            .read_to_end(&mut body)
            .map_err(|e| HttpError::Body(e.to_string()))?;
        if body.len() as u64 > self.max_body_bytes {
            return Err(HttpError::BodyTooLarge(self.max_body_bytes));
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            body,
            headers,
        })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(&HttpConfig::default())
    }
}

fn with_headers<B>(
    mut builder: ureq::RequestBuilder<B>,
    headers: &[(String, String)],
) -> ureq::RequestBuilder<B> {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    /// Serve one request, answer with `status` and echo the request line
    /// and body back in the response body
    fn one_shot_server(status: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/path", listener.local_addr().unwrap());
        let thread = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();

            let mut content_length = 0usize;
            let mut head = String::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap();
                }
                head.push_str(&line);
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();

            let reply = format!("{} {}", request_line.trim(), String::from_utf8_lossy(&body));
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nX-Test: yes\r\nConnection: close\r\n\r\n{reply}",
                reply.len()
            )
            .unwrap();
            head
        });
        (url, thread)
    }

    #[test]
    fn get_returns_body_and_headers() {
        let (url, server) = one_shot_server("200 OK");
        let response = HttpClient::default().execute(&HttpRequest::get(&url)).unwrap();
        assert!(response.success());
        assert_eq!(response.status, 200);
        assert_eq!(response.status_message, "OK");
        assert_eq!(response.body, b"GET /path HTTP/1.1 ");
        assert!(response
            .headers
            .iter()
            .any(|(k, v)| k == "x-test" && v == "yes"));
        server.join().unwrap();
    }

    #[test]
    fn post_sends_body_and_content_type() {
        let (url, server) = one_shot_server("201 Created");
        let mut request = HttpRequest::post(&url, b"{\"a\":1}".to_vec());
        request.headers.push(("X-Custom".into(), "1".into()));
        let response = HttpClient::default().execute(&request).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"POST /path HTTP/1.1 {\"a\":1}");

        let head = server.join().unwrap().to_ascii_lowercase();
        assert!(head.contains("content-type: application/json"));
        assert!(head.contains("x-custom: 1"));
    }

    #[test]
    fn error_status_is_a_response() {
        let (url, server) = one_shot_server("404 Not Found");
        let response = HttpClient::default().execute(&HttpRequest::get(&url)).unwrap();
        assert!(!response.success());
        assert_eq!(response.status, 404);
        server.join().unwrap();
    }

    #[test]
    fn body_limit_enforced() {
        let (url, server) = one_shot_server("200 OK");
        let client = HttpClient::new(&HttpConfig {
            max_body_bytes: 4,
            ..HttpConfig::default()
        });
        assert_eq!(
            client.execute(&HttpRequest::get(&url)),
            Err(HttpError::BodyTooLarge(4))
        );
        server.join().unwrap();
    }

    #[test]
    fn methods_parse() {
        assert_eq!(Method::parse("patch").unwrap(), Method::Patch);
        assert!(matches!(
            Method::parse("BREW"),
            Err(HttpError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn unreachable_host_is_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpClient::new(&HttpConfig {
            timeout_ms: 500,
            ..HttpConfig::default()
        });
        let err = client
            .execute(&HttpRequest::get(format!("http://127.0.0.1:{port}/")))
            .unwrap_err();
        assert!(matches!(err, HttpError::Request { method: "GET", .. }));
    }
}
