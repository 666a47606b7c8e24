//! HTTP Client
//!
//! Uses hyper with tokio for HTTP/1.1 over whatever route the shared
//! [`NetworkSettings`] currently dictate.
//! Features:
//! - Direct, HTTP-proxy and SOCKS5 routes
//! - Automatic HTTPS with rustls (memory-safe TLS)
//! - Challenge-driven proxy authentication
//! - Completed-exchange feed for traffic accounting
//! - Per-host cookie jar

use crate::cookies::CookieJar;
use crate::dial::{self, AuthChallenge, AuthHandler, DialError};
use crate::route::{NetworkSettings, ProxyScheme, ProxyServer, Route};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, SET_COOKIE, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// Capacity of the completed-exchange feed
const EXCHANGE_FEED_CAPACITY: usize = 256;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] DialError),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout
    pub timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "fOS-Proxy/0.1".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Time to first byte
    pub ttfb: Duration,
    /// Total request time
    pub total_time: Duration,
    /// Route the request took
    pub route: Route,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// A finished request/response pair, published to exchange observers
#[derive(Debug, Clone)]
pub struct CompletedExchange {
    pub url: String,
    pub method: Method,
    pub status: u16,
    /// Downstream bytes when measurable (never for `HEAD`)
    pub content_length: Option<u64>,
    /// Whether the exchange went through a proxy
    pub proxied: bool,
}

/// Client statistics
#[derive(Debug, Default)]
struct ClientStats {
    requests_made: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// HTTP client that follows the shared proxy settings
///
/// Cloning is cheap and clones share the route, cookie jar, exchange feed
/// and statistics.
#[derive(Clone)]
pub struct HttpClient {
    config: HttpClientConfig,
    settings: NetworkSettings,
    cookies: CookieJar,
    auth: Arc<RwLock<Option<Arc<dyn AuthHandler>>>>,
    tls: Arc<ClientConfig>,
    exchanges: broadcast::Sender<CompletedExchange>,
    stats: Arc<ClientStats>,
}

impl HttpClient {
    /// Create a new HTTP client bound to `settings`
    pub fn new(config: HttpClientConfig, settings: NetworkSettings, cookies: CookieJar) -> Self {
        info!("HTTP client initialized (timeout: {:?})", config.timeout);

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (exchanges, _) = broadcast::channel(EXCHANGE_FEED_CAPACITY);

        Self {
            config,
            settings,
            cookies,
            auth: Arc::new(RwLock::new(None)),
            tls: Arc::new(tls),
            exchanges,
            stats: Arc::new(ClientStats::default()),
        }
    }

    /// Create with default configuration and fresh settings
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default(), NetworkSettings::new(), CookieJar::new())
    }

    /// Install the proxy authentication hook
    pub fn set_auth_handler(&self, handler: Arc<dyn AuthHandler>) {
        *self.auth.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Shared routing settings
    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    /// Shared cookie jar
    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Observe completed exchanges
    pub fn subscribe_exchanges(&self) -> broadcast::Receiver<CompletedExchange> {
        self.exchanges.subscribe()
    }

    /// Perform a HEAD request
    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::HEAD, url).await
    }

    /// Perform a GET request
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url).await
    }

    /// Perform a HEAD request bounded by `timeout` instead of the configured one
    pub async fn head_with_timeout(&self, url: &str, timeout: Duration) -> Result<Response, HttpError> {
        self.request_with_timeout(Method::HEAD, url, timeout).await
    }

    /// Perform a bodiless request with the configured timeout
    pub async fn request(&self, method: Method, url: &str) -> Result<Response, HttpError> {
        self.request_with_timeout(method, url, self.config.timeout).await
    }

    /// Perform a bodiless request bounded by `timeout`
    pub async fn request_with_timeout(
        &self,
        method: Method,
        url: &str,
        timeout: Duration,
    ) -> Result<Response, HttpError> {
        tokio::time::timeout(timeout, self.send(method, url))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    fn auth_handler(&self) -> Option<Arc<dyn AuthHandler>> {
        self.auth.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn send(&self, method: Method, url: &str) -> Result<Response, HttpError> {
        let start = Instant::now();
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);

        // 1. Parse URL
        let url = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl("No port for scheme".to_string()))?;
        let is_https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(HttpError::InvalidUrl(format!("Unsupported scheme: {}", other))),
        };

        // 2. Pick route from the shared settings
        let route = self.settings.route_for(&host);
        let auth = self.auth_handler();

        // 3. Send, answering at most one proxy challenge on plain-HTTP forwarding
        let mut proxy_auth: Option<String> = None;
        let ttfb_start = Instant::now();
        let response = loop {
            let response = match &route {
                Route::Proxy(server) if server.scheme == ProxyScheme::Http && !is_https => {
                    let stream = dial::connect_direct(&server.host, server.port).await?;
                    let request = self.build_request(&method, &url, &host, true, proxy_auth.as_deref())?;
                    Self::exchange(stream, request).await?
                }
                Route::Proxy(server) => {
                    let stream = dial::connect_tunnel(server, &host, port, auth.as_deref()).await?;
                    self.send_over(stream, is_https, &method, &url, &host).await?
                }
                Route::Direct => {
                    let stream = dial::connect_direct(&host, port).await?;
                    self.send_over(stream, is_https, &method, &url, &host).await?
                }
            };

            if response.status() == StatusCode::PROXY_AUTHENTICATION_REQUIRED && proxy_auth.is_none() {
                if let Route::Proxy(server) = &route {
                    if let Some(header) = Self::answer_challenge(server, &response, auth.as_deref()) {
                        proxy_auth = Some(header);
                        continue;
                    }
                }
            }
            break response;
        };
        let ttfb = ttfb_start.elapsed();

        // 4. Read response
        let status = response.status();
        let headers = response.headers().clone();
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(value) = value.to_str() {
                self.cookies.record(&host, value);
            }
        }

        let max_body_size = self.config.max_body_size;
        let collected = Limited::new(response.into_body(), max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    HttpError::BodyError(format!("body exceeds {} bytes", max_body_size))
                } else {
                    HttpError::BodyError(e.to_string())
                }
            })?;
        let body = collected.to_bytes().to_vec();
        self.stats.bytes_downloaded.fetch_add(body.len() as u64, Ordering::Relaxed);

        let content_length = if method == Method::HEAD {
            None
        } else {
            headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .or(Some(body.len() as u64))
        };

        // No receivers is fine
        let _ = self.exchanges.send(CompletedExchange {
            url: url.to_string(),
            method: method.clone(),
            status: status.as_u16(),
            content_length,
            proxied: matches!(route, Route::Proxy(_)),
        });

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?} TTFB)",
            method, url, status, body.len(), ttfb
        );

        Ok(Response {
            status,
            headers,
            body,
            ttfb,
            total_time: start.elapsed(),
            route,
        })
    }

    fn answer_challenge(
        server: &ProxyServer,
        response: &hyper::Response<Incoming>,
        auth: Option<&dyn AuthHandler>,
    ) -> Option<String> {
        let realm = response
            .headers()
            .get("proxy-authenticate")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split("realm=\"").nth(1))
            .and_then(|v| v.split('"').next())
            .map(str::to_string);
        let challenge = AuthChallenge {
            proxy: server.clone(),
            realm,
        };
        auth.and_then(|handler| handler.credentials(&challenge))
            .map(|creds| creds.basic_header())
    }

    fn build_request(
        &self,
        method: &Method,
        url: &Url,
        host: &str,
        absolute_form: bool,
        proxy_auth: Option<&str>,
    ) -> Result<Request<Full<Bytes>>, HttpError> {
        let target = if absolute_form {
            url.as_str().to_string()
        } else {
            match url.query() {
                Some(q) => format!("{}?{}", url.path(), q),
                None => url.path().to_string(),
            }
        };
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(target)
            .header(USER_AGENT, &self.config.user_agent)
            .header(HOST, host_header);
        if let Some(cookie) = self.cookies.header_for(host) {
            builder = builder.header(COOKIE, cookie);
        }
        if let Some(value) = proxy_auth {
            builder = builder.header("proxy-authorization", value);
        }

        builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| HttpError::HttpError(e.to_string()))
    }

    async fn send_over(
        &self,
        stream: tokio::net::TcpStream,
        is_https: bool,
        method: &Method,
        url: &Url,
        host: &str,
    ) -> Result<hyper::Response<Incoming>, HttpError> {
        let request = self.build_request(method, url, host, false, None)?;
        if !is_https {
            return Self::exchange(stream, request).await;
        }

        let connector = TlsConnector::from(self.tls.clone());
        let server_name = rustls::pki_types::ServerName::try_from(
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
        )
        .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| HttpError::TlsError(e.to_string()))?;

        Self::exchange(tls_stream, request).await
    }

    async fn exchange<S>(
        stream: S,
        request: Request<Full<Bytes>>,
    ) -> Result<hyper::Response<Incoming>, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Connection error: {}", e);
            }
        });

        sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))
    }

    /// Get client statistics (requests made, bytes downloaded)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.bytes_downloaded.load(Ordering::Relaxed),
        )
    }
}
