//! fOS Network Layer
//!
//! The routing layer the proxy lifecycle configures. It owns no policy:
//! it applies whatever proxy rule it is given, dials through it, and
//! reports what happened.
//!
//! Architecture:
//! 1. Request comes in → route chosen from the shared [`NetworkSettings`]
//! 2. Direct, HTTP `CONNECT`/forward, or SOCKS5 tunnel
//! 3. Proxy challenges answered by the installed [`AuthHandler`]
//! 4. Response collected → [`CompletedExchange`] published to observers

mod client;
mod cookies;
mod dial;
mod route;

pub use client::{CompletedExchange, HttpClient, HttpClientConfig, HttpError, Response};
pub use cookies::CookieJar;
pub use dial::{AuthChallenge, AuthHandler, Credentials, DialError};
pub use hyper::Method;
pub use route::{
    NetworkSettings, ProxyMode, ProxyRule, ProxyScheme, ProxyServer, Route, RouteError,
    LOCAL_BYPASS,
};
