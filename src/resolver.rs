// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Destination filename resolution.
//!
//! Strategies, tried in order, each only when the previous one found nothing:
//!
//! 1. Query-string hints (`filename`, `file`, `name`,
//!    `response-content-disposition`). Confident.
//! 2. `Content-Disposition` from a HEAD request (GET without reading the body
//!    when HEAD is refused with 403/405). Confident.
//! 3. Basename of the URL path. Not confident.
//!
//! A confident name may be forced as the output filename; a guess must not
//! be, so the download daemon can still negotiate the name itself.
//!
//! Nothing in here returns an error. Probe failures are logged and resolution
//! moves on to the next strategy.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION};
use reqwest::StatusCode;
use url::Url;

use crate::paths::basename;

/// Timeout for the header probe.
const PROBE_TIMEOUT_SECS: u64 = 10;

/// Query keys checked for a filename hint, in order of preference.
const QUERY_KEYS: [&str; 4] = ["filename", "file", "name", "response-content-disposition"];

static CD_EXTENDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)filename\*\s*=\s*[^'";]+''([^;]+)"#).expect("RFC 5987 filename regex")
});
static CD_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)filename\s*=\s*"([^"]+)""#).expect("quoted filename regex"));
static CD_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)filename\s*=\s*([^;]+)").expect("bare filename regex"));

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedName {
    pub name: Option<String>,
    pub confident: bool,
}

impl ResolvedName {
    fn confident(name: String) -> Self {
        Self { name: Some(name), confident: true }
    }

    fn guess(name: String) -> Self {
        Self { name: Some(name), confident: false }
    }

    /// The name to force as output, if we are allowed to force one.
    pub fn forced_name(&self) -> Option<&str> {
        if self.confident {
            self.name.as_deref()
        } else {
            None
        }
    }
}

/// Replace characters that are unsafe in filenames with `_` and trim.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn clean(candidate: &str) -> Option<String> {
    let name = sanitize_filename(basename(candidate));
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Extract a filename from a `Content-Disposition` value.
///
/// RFC 5987 `filename*=` wins over `filename="..."`, which wins over a bare
/// `filename=`.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        return None;
    }

    if let Some(caps) = CD_EXTENDED.captures(value) {
        let decoded = percent_decode_str(&caps[1]).decode_utf8_lossy();
        if let Some(name) = clean(&decoded) {
            return Some(name);
        }
    }

    if let Some(caps) = CD_QUOTED.captures(value) {
        return clean(&caps[1]);
    }

    if let Some(caps) = CD_BARE.captures(value) {
        return clean(caps[1].trim());
    }

    None
}

/// Filename hint carried in the URL's query string.
pub fn query_filename(url: &Url) -> Option<String> {
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

    for key in QUERY_KEYS {
        // First occurrence of the key only, like a typical query parser.
        let Some((_, value)) = pairs.iter().find(|(k, v)| k == key && !v.is_empty()) else {
            continue;
        };
        if key == "response-content-disposition" {
            if let Some(name) = parse_content_disposition(value) {
                return Some(name);
            }
        }
        if let Some(name) = clean(value) {
            return Some(name);
        }
    }
    None
}

/// Sanitized basename of the URL path.
pub fn path_filename(url: &Url) -> Option<String> {
    clean(url.path())
}

/// Source of a `Content-Disposition` header for a URL.
#[async_trait]
pub trait HeaderProbe: Send + Sync {
    /// Returns the header value, or `None` on any failure or absence.
    async fn content_disposition(&self, url: &str, token: Option<&str>) -> Option<String>;
}

/// Probe that asks the origin server with HEAD, falling back to a body-less GET.
#[derive(Debug, Clone)]
pub struct HttpHeaderProbe {
    client: reqwest::Client,
}

impl HttpHeaderProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        token: Option<&str>,
    ) -> reqwest::Result<reqwest::Response> {
        let mut request = self.client.request(method, url);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request.send().await
    }
}

impl Default for HttpHeaderProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HeaderProbe for HttpHeaderProbe {
    async fn content_disposition(&self, url: &str, token: Option<&str>) -> Option<String> {
        let response = match self.send(reqwest::Method::HEAD, url, token).await {
            Ok(resp) if matches!(resp.status(), StatusCode::FORBIDDEN | StatusCode::METHOD_NOT_ALLOWED) => {
                tracing::debug!(status = %resp.status(), "HEAD refused, probing with GET");
                // Headers only; the body is dropped unread with the response.
                match self.send(reqwest::Method::GET, url, token).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        tracing::debug!(error = %e, "GET probe failed");
                        return None;
                    }
                }
            }
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "HEAD probe failed");
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "Header probe got non-success status");
            return None;
        }

        response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// Resolves destination filenames for the daemon backend.
#[derive(Clone)]
pub struct FilenameResolver {
    probe: Arc<dyn HeaderProbe>,
}

impl FilenameResolver {
    pub fn new(probe: Arc<dyn HeaderProbe>) -> Self {
        Self { probe }
    }

    /// Resolver backed by real HTTP probes.
    pub fn http() -> Self {
        Self::new(Arc::new(HttpHeaderProbe::new()))
    }

    pub async fn resolve(&self, url: &str, token: Option<&str>) -> ResolvedName {
        let parsed = match Url::parse(url) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!(error = %e, "URL did not parse; skipping query and path hints");
                None
            }
        };

        if let Some(name) = parsed.as_ref().and_then(query_filename) {
            tracing::debug!(name = %name, "Filename from query string");
            return ResolvedName::confident(name);
        }

        if let Some(header) = self.probe.content_disposition(url, token).await {
            if let Some(name) = parse_content_disposition(&header) {
                tracing::debug!(name = %name, "Filename from Content-Disposition");
                return ResolvedName::confident(name);
            }
        }

        if let Some(name) = parsed.as_ref().and_then(path_filename) {
            tracing::debug!(name = %name, "Filename guessed from URL path");
            return ResolvedName::guess(name);
        }

        ResolvedName::default()
    }
}

impl std::fmt::Debug for FilenameResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilenameResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Probe returning a fixed header and counting how often it was asked.
    struct FixedProbe {
        header: Option<String>,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(header: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                header: header.map(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HeaderProbe for FixedProbe {
        async fn content_disposition(&self, _url: &str, _token: Option<&str>) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.header.clone()
        }
    }

    #[test]
    fn test_sanitize_keeps_spaces() {
        assert_eq!(sanitize_filename("a b.txt"), "a b.txt");
        assert_eq!(sanitize_filename(r#"a<b>c:d"e|f?g*h"#), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_filename("x\u{1}y\tz"), "x_y_z");
        assert_eq!(sanitize_filename("  padded.bin  "), "padded.bin");
    }

    #[test]
    fn test_parse_quoted() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="a b.txt""#),
            Some("a b.txt".to_string())
        );
    }

    #[test]
    fn test_parse_rfc5987() {
        assert_eq!(
            parse_content_disposition("attachment; filename*=UTF-8''caf%C3%A9.png"),
            Some("café.png".to_string())
        );
    }

    #[test]
    fn test_parse_rfc5987_wins_over_quoted() {
        let value = r#"attachment; filename="fallback.bin"; FILENAME*=utf-8''real%20name.bin"#;
        assert_eq!(parse_content_disposition(value), Some("real name.bin".to_string()));
    }

    #[test]
    fn test_parse_bare_stops_at_semicolon() {
        assert_eq!(
            parse_content_disposition("attachment; filename=model.ckpt; size=10"),
            Some("model.ckpt".to_string())
        );
    }

    #[test]
    fn test_parse_strips_directories() {
        assert_eq!(
            parse_content_disposition(r#"attachment; filename="../../etc/passwd""#),
            Some("passwd".to_string())
        );
    }

    #[test]
    fn test_parse_nothing_usable() {
        assert_eq!(parse_content_disposition(""), None);
        assert_eq!(parse_content_disposition("inline"), None);
    }

    #[test]
    fn test_query_key_preference() {
        let url = Url::parse("https://cdn.example.com/dl?name=second.bin&filename=first.bin").unwrap();
        assert_eq!(query_filename(&url), Some("first.bin".to_string()));
    }

    #[test]
    fn test_query_response_content_disposition() {
        let url = Url::parse(
            "https://bucket.example.com/obj?response-content-disposition=attachment%3B%20filename%3D%22weights.safetensors%22",
        )
        .unwrap();
        assert_eq!(query_filename(&url), Some("weights.safetensors".to_string()));
    }

    #[test]
    fn test_path_filename() {
        let url = Url::parse("https://example.com/files/archive.tar.gz").unwrap();
        assert_eq!(path_filename(&url), Some("archive.tar.gz".to_string()));
        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(path_filename(&root), None);
    }

    #[tokio::test]
    async fn test_query_hint_skips_network() {
        let probe = FixedProbe::new(Some(r#"attachment; filename="other.bin""#));
        let resolver = FilenameResolver::new(probe.clone());

        let resolved = resolver
            .resolve("https://example.com/download?filename=foo.bin", None)
            .await;
        assert_eq!(resolved, ResolvedName { name: Some("foo.bin".into()), confident: true });
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_header_probe_is_confident() {
        let probe = FixedProbe::new(Some(r#"attachment; filename="a b.txt""#));
        let resolver = FilenameResolver::new(probe.clone());

        let resolved = resolver.resolve("https://example.com/get/123", Some("tok")).await;
        assert_eq!(resolved.name.as_deref(), Some("a b.txt"));
        assert!(resolved.confident);
        assert_eq!(resolved.forced_name(), Some("a b.txt"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_path_fallback_not_confident() {
        let resolver = FilenameResolver::new(FixedProbe::new(None));
        let resolved = resolver.resolve("https://example.com/models/unet.safetensors", None).await;
        assert_eq!(resolved.name.as_deref(), Some("unet.safetensors"));
        assert!(!resolved.confident);
        assert_eq!(resolved.forced_name(), None);
    }

    #[tokio::test]
    async fn test_unusable_header_falls_through() {
        let resolver = FilenameResolver::new(FixedProbe::new(Some("inline")));
        let resolved = resolver.resolve("https://example.com/x/y.zip", None).await;
        assert_eq!(resolved, ResolvedName { name: Some("y.zip".into()), confident: false });
    }

    #[tokio::test]
    async fn test_nothing_found() {
        let resolver = FilenameResolver::new(FixedProbe::new(None));
        assert_eq!(resolver.resolve("https://example.com/", None).await, ResolvedName::default());
        assert_eq!(resolver.resolve("not a url", None).await, ResolvedName::default());
    }

    /// Answer one request per canned response, each on its own connection,
    /// and hand back the request lines seen.
    fn serve_sequence(responses: &[&'static [u8]]) -> (String, thread::JoinHandle<Vec<String>>) {
        let responses = responses.to_vec();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut seen = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut chunk).unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&chunk[..n]);
                }
                stream.write_all(response).unwrap();
                seen.push(String::from_utf8_lossy(&head).to_lowercase());
            }
            seen
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_http_probe_retries_refused_head_with_get() {
        let (base, server) = serve_sequence(&[
            b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename*=UTF-8''caf%C3%A9.png\r\nContent-Length: 4\r\nConnection: close\r\n\r\nPNG!",
        ]);

        let resolved = FilenameResolver::http()
            .resolve(&format!("{base}/blob/123"), Some("tok"))
            .await;
        assert_eq!(resolved, ResolvedName { name: Some("café.png".into()), confident: true });

        let seen = server.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("head /blob/123 "));
        assert!(seen[1].starts_with("get /blob/123 "));
        assert!(seen.iter().all(|h| h.contains("authorization: bearer tok")));
    }

    #[tokio::test]
    async fn test_http_probe_failed_get_falls_back_to_path() {
        let (base, server) = serve_sequence(&[
            b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            b"HTTP/1.1 404 Not Found\r\nContent-Disposition: attachment; filename=\"wrong.bin\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ]);

        let resolved = FilenameResolver::http()
            .resolve(&format!("{base}/files/model.bin"), None)
            .await;
        assert_eq!(resolved, ResolvedName { name: Some("model.bin".into()), confident: false });
        assert_eq!(server.join().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_http_probe_head_without_header() {
        let (base, server) = serve_sequence(&[
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        ]);

        let probe = HttpHeaderProbe::new();
        assert_eq!(probe.content_disposition(&format!("{base}/x/y.zip"), None).await, None);

        let seen = server.join().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].starts_with("head /x/y.zip "));
        assert!(!seen[0].contains("authorization"));
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let resolver = FilenameResolver::new(FixedProbe::new(Some(
            "attachment; filename*=UTF-8''caf%C3%A9.png",
        )));
        let first = resolver.resolve("https://example.com/blob", None).await;
        let second = resolver.resolve("https://example.com/blob", None).await;
        assert_eq!(first, second);
        assert_eq!(first.name.as_deref(), Some("café.png"));
    }
}
