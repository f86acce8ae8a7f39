//! Minimal HTTP/1.0 fetch over an established proxy connection
//!
//! The probe issues one GET per circuit and reads the whole body. HTTP/1.0
//! with `Connection: close` keeps framing simple: the body ends at EOF.

use std::fmt;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProbeError, Result};

/// Largest response body accepted
pub const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

/// Where a fetch goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub is_https: bool,
}

impl Target {
    /// Parse an `http://` or `https://` URL; a bare host is treated as http
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();

        let (without_scheme, is_https) = if let Some(rest) = url.strip_prefix("http://") {
            (rest, false)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (rest, true)
        } else if url.contains("://") {
            return Err(ProbeError::InvalidUrl(format!("unsupported scheme in {}", url)));
        } else {
            (url, false)
        };

        let (host_port, path) = match without_scheme.find('/') {
            Some(slash_pos) => (
                &without_scheme[..slash_pos],
                &without_scheme[slash_pos..],
            ),
            None => (without_scheme, "/"),
        };

        let (host, port) = match host_port.rfind(':') {
            Some(colon_pos) => {
                let port_str = &host_port[colon_pos + 1..];
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| ProbeError::InvalidUrl(format!("Invalid port: {}", port_str)))?;
                (&host_port[..colon_pos], port)
            }
            None => (host_port, if is_https { 443 } else { 80 }),
        };

        if host.is_empty() {
            return Err(ProbeError::InvalidUrl(format!("missing host in {:?}", url)));
        }

        Ok(Self {
            host: host.to_lowercase(),
            port,
            path: path.to_string(),
            is_https,
        })
    }

    /// `host:port`, as given to the proxy
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_https { "https" } else { "http" };
        write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

/// A complete HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First header with this name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Build the GET request for `target`
pub fn build_get_request(target: &Target, user_agent: &str) -> String {
    format!(
        "GET {} HTTP/1.0\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Accept: text/html\r\n\
         Connection: close\r\n\
         \r\n",
        target.path, target.host, user_agent
    )
}

/// Split a raw response into status, headers and body
pub fn parse_response(raw: &[u8]) -> Result<HttpResponse> {
    let (head_end, body_start) = if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n")
    {
        (pos, pos + 4)
    } else if let Some(pos) = raw.windows(2).position(|w| w == b"\n\n") {
        (pos, pos + 2)
    } else {
        return Err(ProbeError::Http("response has no header terminator".into()));
    };

    let head = String::from_utf8_lossy(&raw[..head_end]);
    let mut lines = head.lines();

    let status_line = lines.next().unwrap_or("");
    if !status_line.starts_with("HTTP/") {
        return Err(ProbeError::Http(format!("Invalid status line: {:?}", status_line)));
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProbeError::Http(format!("Invalid status line: {:?}", status_line)))?;

    let headers = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(HttpResponse {
        status,
        headers,
        body: raw[body_start..].to_vec(),
    })
}

/// Send a GET for `target` over `conn` and read the full response
///
/// The request goes out as written; for https targets `conn` must be the
/// TLS stream returned by [`crate::Transport::establish`].
pub async fn fetch<C>(conn: &mut C, target: &Target, user_agent: &str) -> Result<HttpResponse>
where
    C: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = build_get_request(target, user_agent);
    log::debug!("📤 GET {} ({} bytes)", target, request.len());

    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let mut raw = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = conn.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        raw.extend_from_slice(&buffer[..n]);
        if raw.len() > MAX_RESPONSE_BYTES {
            return Err(ProbeError::ResponseTooLarge {
                limit: MAX_RESPONSE_BYTES,
            });
        }
    }

    let response = parse_response(&raw)?;
    log::debug!(
        "📥 {} from {} ({} body bytes)",
        response.status,
        target.host,
        response.body.len()
    );
    Ok(response)
}
