/*!
 * # Upstream Module
 *
 * The outbound HTTP seam of the offshore peer. The dispatcher only depends
 * on the [`HttpExecutor`] trait; [`ReqwestExecutor`] is the production
 * implementation and tests substitute their own.
 */

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// A fully buffered outbound request, exactly as it crossed the uplink.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Performs one outbound HTTP request on behalf of the ship.
///
/// Any error from an implementation is reported to the client as a synthetic
/// `502 Bad Gateway`; implementations do not need their own fallback.
pub trait HttpExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<OutboundResponse>> + Send;
}

/// [`HttpExecutor`] backed by a shared `reqwest` client.
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    /// Build the executor, optionally capping each outbound request's total
    /// duration.
    pub fn new(request_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(ReqwestExecutor {
            client: builder.build()?,
        })
    }
}

impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Custom(format!("invalid HTTP method {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            // Proxy-Connection is hop-by-hop between client and ship.
            if name.eq_ignore_ascii_case("proxy-connection") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await?;
        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            // The body crosses the uplink fully buffered, so a chunked
            // Transfer-Encoding header would no longer describe it.
            if name.as_str().eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = response.bytes().await?.to_vec();
        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}
