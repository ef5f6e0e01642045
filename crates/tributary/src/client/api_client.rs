//! Synchronous REST client.
//!
//! "Synchronous" means one request per call: the caller awaits the response.
//! Requests are built in a fixed order:
//!
//! 1. `Content-Type: application/json`
//! 2. default headers
//! 3. per-call headers
//! 4. the auth hook
//! 5. the before-request hook
//!
//! # Example
//!
//! ```ignore
//! let client = ApiClient::from_settings("https://api.github.com", &settings.api, shutdown)?
//!     .with_header("Accept", "application/vnd.github+json");
//! client.set_auth_function(Arc::new(|req| {
//!     req.set_header("Authorization", format!("Bearer {token}"));
//!     Ok(())
//! }));
//!
//! if let Some(response) = client.get("repos/rust-lang/rust", &[], &[]).await? {
//!     let repo: Repo = unmarshal(&response)?;
//! }
//! ```

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use url::Url;

use crate::context::Shutdown;
use crate::error::{HarvestError, Result};
use crate::http::{
    HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport,
    TransportOptions,
};
use crate::settings::ApiSettings;

/// Query string pairs, appended in order.
pub type Query = Vec<(String, String)>;

/// Hook that may modify a request before it is sent.
pub type BeforeRequestHook = Arc<dyn Fn(&mut HttpRequest) -> Result<()> + Send + Sync>;

/// Hook that inspects a response before anything else sees it.
pub type AfterResponseHook = Arc<dyn Fn(&HttpResponse) -> Result<AfterResponse> + Send + Sync>;

/// Outcome of an after-response hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterResponse {
    /// Keep processing the response.
    Continue,
    /// Drop the response without treating it as an error.
    Ignore,
}

/// Message attached to 401 responses by the default after-response hook.
pub const UNAUTHORIZED_MESSAGE: &str = "authentication failed, please check your AccessToken";

/// Message attached to 422 responses by the default after-response hook.
pub const UNPROCESSABLE_MESSAGE: &str =
    "request rejected by the API, please check the permissions of your AccessToken";

/// After-response hook mapping 401 and 422 to [`HarvestError::Unauthorized`].
pub fn default_after_response() -> AfterResponseHook {
    Arc::new(|response: &HttpResponse| match response.status {
        401 => Err(HarvestError::Unauthorized {
            status: 401,
            message: UNAUTHORIZED_MESSAGE.to_string(),
        }),
        422 => Err(HarvestError::Unauthorized {
            status: 422,
            message: UNPROCESSABLE_MESSAGE.to_string(),
        }),
        _ => Ok(AfterResponse::Continue),
    })
}

/// REST client bound to one endpoint.
///
/// Cheap to clone; hooks and transport are shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    endpoint: Url,
    headers: HttpHeaders,
    timeout: Option<Duration>,
    auth: Option<BeforeRequestHook>,
    before_request: Option<BeforeRequestHook>,
    after_response: Option<AfterResponseHook>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .field("headers", &self.headers.len())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client for `endpoint` on top of `transport`.
    ///
    /// The endpoint always gets a trailing slash so relative paths extend it
    /// instead of replacing its last segment.
    pub fn new(endpoint: &str, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        Ok(Self {
            transport,
            endpoint: parse_endpoint(endpoint)?,
            headers: Vec::new(),
            timeout: None,
            auth: None,
            before_request: None,
            after_response: Some(default_after_response()),
            shutdown: Shutdown::new(),
        })
    }

    /// Create a reqwest-backed client configured from the `[api]` settings.
    ///
    /// # Errors
    /// Fails on an invalid endpoint or proxy, or when the endpoint is a
    /// literal IP address inside `endpoint_cidr_blacklist`.
    pub fn from_settings(endpoint: &str, api: &ApiSettings, shutdown: Shutdown) -> Result<Self> {
        let parsed = parse_endpoint(endpoint)?;
        if let Some(blacklist) = api.endpoint_cidr_blacklist.as_deref() {
            check_cidr_blacklist(blacklist, &parsed)?;
        }

        let transport = ReqwestTransport::with_options(&TransportOptions::from_settings(api))
            .map_err(|e| HarvestError::config(e.to_string()))?;

        let mut client = Self::new(endpoint, Arc::new(transport))?;
        client.timeout = api.timeout();
        client.shutdown = shutdown;
        Ok(client)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HttpHeaders) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn set_auth_function(&mut self, hook: BeforeRequestHook) {
        self.auth = Some(hook);
    }

    pub fn set_before_function(&mut self, hook: BeforeRequestHook) {
        self.before_request = Some(hook);
    }

    /// Replace the after-response hook. `None` disables status mapping.
    pub fn set_after_function(&mut self, hook: Option<AfterResponseHook>) {
        self.after_response = hook;
    }

    pub fn after_function(&self) -> Option<AfterResponseHook> {
        self.after_response.clone()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Resolve `path` against the endpoint and append `query` in order.
    ///
    /// Absolute `http(s)://` paths are used as is.
    pub fn resolve_url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path)
        } else {
            self.endpoint.join(path.strip_prefix('/').unwrap_or(path))
        }
        .map_err(|e| HarvestError::config(format!("invalid url {path}: {e}")))?;

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// Build a request and run the auth and before-request hooks on it.
    pub fn build_request(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<&JsonValue>,
    ) -> Result<HttpRequest> {
        let url = self.resolve_url(path, query)?;
        let mut request = HttpRequest {
            method,
            url: url.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: match body {
                Some(body) => serde_json::to_vec(body)?,
                None => Vec::new(),
            },
        };
        for (name, value) in &self.headers {
            request.set_header(name, value.clone());
        }
        request.headers.extend(headers.iter().cloned());

        if let Some(auth) = &self.auth {
            auth(&mut request)?;
        }
        if let Some(before) = &self.before_request {
            before(&mut request)?;
        }
        Ok(request)
    }

    /// Send a prepared request under the timeout and the shutdown signal.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.shutdown.check()?;
        let url = request.url.clone();
        tracing::debug!(method = %request.method, url = %url, "Sending request");

        let call = async {
            let sent = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.transport.send(request))
                    .await
                    .map_err(|_| {
                        HarvestError::transport(&url, format!("request timed out after {limit:?}"))
                    })?,
                None => self.transport.send(request).await,
            };
            sent.map_err(|e| HarvestError::transport(&url, e.to_string()))
        };

        let response = tokio::select! {
            result = call => result?,
            _ = self.shutdown.requested() => return Err(HarvestError::Cancelled),
        };
        tracing::debug!(status = response.status, url = %url, "Received response");
        Ok(response)
    }

    /// Build and send a request without running the after-response hook.
    pub async fn send(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<&JsonValue>,
    ) -> Result<HttpResponse> {
        let request = self.build_request(method, path, query, headers, body)?;
        self.execute(request).await
    }

    /// Run `hook` (or the client's own after-response hook) on `response`.
    pub fn apply_after_response(
        &self,
        response: &HttpResponse,
        hook: Option<&AfterResponseHook>,
    ) -> Result<AfterResponse> {
        match hook.or(self.after_response.as_ref()) {
            Some(hook) => hook(response).inspect_err(|e| {
                tracing::debug!(url = %response.url, error = %e, "After-response hook rejected response");
            }),
            None => Ok(AfterResponse::Continue),
        }
    }

    /// Send a request and run the after-response hook.
    ///
    /// Returns `None` when the hook asked to ignore the response.
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<&JsonValue>,
    ) -> Result<Option<HttpResponse>> {
        let response = self.send(method, path, query, headers, body).await?;
        match self.apply_after_response(&response, None)? {
            AfterResponse::Continue => Ok(Some(response)),
            AfterResponse::Ignore => Ok(None),
        }
    }

    pub async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<Option<HttpResponse>> {
        self.request(HttpMethod::Get, path, query, headers, None).await
    }

    pub async fn post(
        &self,
        path: &str,
        query: &[(String, String)],
        body: &JsonValue,
        headers: &[(String, String)],
    ) -> Result<Option<HttpResponse>> {
        self.request(HttpMethod::Post, path, query, headers, Some(body))
            .await
    }
}

/// Decode a JSON response body.
///
/// # Errors
/// Returns [`HarvestError::EmptyResponse`] for an empty body and
/// [`HarvestError::Parse`] when the body is not valid JSON for `T`.
pub fn unmarshal<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    if response.body.is_empty() {
        return Err(HarvestError::EmptyResponse {
            url: response.url.clone(),
        });
    }
    serde_json::from_slice(&response.body).map_err(|e| {
        HarvestError::parse(format!(
            "error decoding response from {}: {e}: raw response: {}",
            response.url,
            response.text()
        ))
    })
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let normalized = if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{endpoint}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|e| HarvestError::config(format!("invalid endpoint {endpoint}: {e}")))?;
    if url.host_str().is_none() {
        return Err(HarvestError::config(format!("invalid endpoint {endpoint}: missing host")));
    }
    Ok(url)
}

/// Reject endpoints whose host is a literal IP inside one of the
/// comma-separated CIDR ranges.
///
/// Hostnames are not resolved.
pub fn check_cidr_blacklist(blacklist: &str, endpoint: &Url) -> Result<()> {
    let ip = match endpoint.host() {
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip),
        Some(url::Host::Domain(_)) => return Ok(()),
        None => return Err(HarvestError::config("invalid endpoint: missing host")),
    };

    for cidr in blacklist.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if cidr_contains(cidr, ip)? {
            return Err(HarvestError::config(format!(
                "host {ip} is not allowed by the endpoint blacklist"
            )));
        }
    }
    Ok(())
}

fn cidr_contains(cidr: &str, ip: IpAddr) -> Result<bool> {
    let invalid = || HarvestError::config(format!("invalid CIDR {cidr}"));
    let (network, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let network: IpAddr = network.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix > 32 {
                return Err(invalid());
            }
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            Ok(u32::from(net) & mask == u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix > 128 {
                return Err(invalid());
            }
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            Ok(u128::from(net) & mask == u128::from(ip) & mask)
        }
        _ => Ok(false),
    }
}
