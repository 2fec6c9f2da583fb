//! Dispatch Layer
//!
//! Executes a [`DataRequest`] against a selected upstream: builds the
//! absolute URL, sets encoding headers, measures latency, classifies the
//! response, and feeds the outcome back into the registry. Retryable
//! failures move to the next candidate with the failed index excluded until
//! the retry budget runs out.

use crate::classify::{classify, error_indicates_not_found, ResponseClass, STATUS_TRANSPORT};
use crate::error::GatewayError;
use crate::registry::{UpstreamKind, UpstreamRegistry};
use crate::request::{BodyEncoding, DataRequest, HttpVerb};
use crate::select::{select, SelectOutcome};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-attempt timeout.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on attempts per request, further capped by pool size.
    pub max_retries: usize,
    /// Pause before spilling into overflow slots when a pool is saturated.
    pub saturation_wait: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            saturation_wait: Duration::from_millis(200),
        }
    }
}

/// Issues upstream attempts for data requests.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<UpstreamRegistry>,
    client: reqwest::Client,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Build a dispatcher and its HTTP client.
    ///
    /// # Errors
    /// Returns [`GatewayError::Fatal`] if the TLS backend cannot initialize.
    pub fn new(registry: Arc<UpstreamRegistry>, config: DispatchConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| GatewayError::Fatal(format!("http client init: {e}")))?;
        Ok(Self {
            registry,
            client,
            config,
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    /// Fetch a data request, failing over across the pool until the retry
    /// budget is exhausted or a terminal class arrives.
    #[tracing::instrument(skip(self, dr), fields(path = %dr.path, method = dr.rpc_method.as_deref().unwrap_or("")))]
    pub async fn fetch(&self, dr: &DataRequest) -> Result<Vec<u8>, GatewayError> {
        let kind = UpstreamKind::for_request(dr.kind).ok_or_else(|| {
            GatewayError::Fatal("internal request reached the external dispatcher".into())
        })?;
        let pool_len = self.registry.pool(kind).len();
        if pool_len == 0 {
            return Err(GatewayError::ResourceExhausted(format!(
                "no {} upstreams configured",
                kind.as_str()
            )));
        }

        let budget = pool_len.min(self.config.max_retries.max(1));
        let method = dr.rpc_method.as_deref();
        let mut exclude = 0u64;
        let mut last_error: Option<GatewayError> = None;

        for _ in 0..budget {
            let Some((idx, overflow)) = self.pick(kind, exclude, dr).await else {
                break;
            };
            if !self.registry.on_attempt_start(kind, idx, overflow) {
                if idx < 64 {
                    exclude |= 1 << idx;
                }
                last_error.get_or_insert_with(|| {
                    GatewayError::ResourceExhausted("upstream refused attempt slot".into())
                });
                continue;
            }

            let url = join_url(&self.registry.pool(kind)[idx].url, &dr.path);
            let started = Instant::now();
            let outcome = self.attempt(dr, &url).await;
            let latency = started.elapsed();

            match outcome {
                Err(message) => {
                    self.registry.on_attempt_end(
                        kind,
                        idx,
                        latency,
                        ResponseClass::Retry,
                        STATUS_TRANSPORT,
                        method,
                    );
                    if idx < 64 {
                        exclude |= 1 << idx;
                    }
                    last_error = Some(GatewayError::Transport(message));
                }
                Ok((status, body)) => {
                    if rpc_error_code(&body) == Some(-32029) {
                        self.registry.note_rate_limited(kind, idx);
                    }
                    let class = classify(status, &body, dr);
                    self.registry
                        .on_attempt_end(kind, idx, latency, class, status, method);
                    match class {
                        ResponseClass::Success => {
                            return Ok(body);
                        }
                        ResponseClass::Retry => {
                            if idx < 64 {
                                exclude |= 1 << idx;
                            }
                            // absence-shaped retries exhaust to NotFound
                            last_error = Some(if error_indicates_not_found(status, dr, &body) {
                                GatewayError::NotFound(excerpt(&body))
                            } else {
                                GatewayError::UpstreamServer {
                                    status,
                                    message: excerpt(&body),
                                }
                            });
                        }
                        ResponseClass::MethodNotSupported => {
                            if let Some(m) = method {
                                self.registry.mark_unsupported(kind, idx, m);
                            }
                            if idx < 64 {
                                exclude |= 1 << idx;
                            }
                            last_error = Some(GatewayError::MethodNotSupported {
                                method: method.unwrap_or("<unknown>").to_string(),
                            });
                        }
                        ResponseClass::UserError => {
                            return Err(GatewayError::UpstreamUser {
                                status,
                                message: excerpt(&body),
                            });
                        }
                        ResponseClass::NotFound => {
                            return Err(GatewayError::NotFound(excerpt(&body)));
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::ResourceExhausted(format!(
                "no remaining {} candidate",
                kind.as_str()
            ))
        }))
    }

    /// One selection pass, waiting out saturation once before overflowing.
    async fn pick(&self, kind: UpstreamKind, exclude: u64, dr: &DataRequest) -> Option<(usize, bool)> {
        let method = dr.rpc_method.as_deref();
        match select(
            &self.registry,
            kind,
            exclude,
            dr.preferred_flags,
            method,
            dr.min_block,
        ) {
            SelectOutcome::Chosen(idx) => Some((idx, false)),
            SelectOutcome::None => None,
            SelectOutcome::Saturated(_) => {
                tokio::time::sleep(self.config.saturation_wait).await;
                match select(
                    &self.registry,
                    kind,
                    exclude,
                    dr.preferred_flags,
                    method,
                    dr.min_block,
                ) {
                    SelectOutcome::Chosen(idx) => Some((idx, false)),
                    SelectOutcome::Saturated(best) => Some((best, true)),
                    SelectOutcome::None => None,
                }
            }
        }
    }

    /// One HTTP attempt. `Err` carries a transport description; `Ok` carries
    /// the status and raw body regardless of status class.
    async fn attempt(&self, dr: &DataRequest, url: &str) -> Result<(u16, Vec<u8>), String> {
        let mut builder = match dr.verb {
            HttpVerb::Get => self.client.get(url),
            HttpVerb::Post => self.client.post(url),
        };
        builder = builder.header(reqwest::header::ACCEPT, dr.encoding.mime());
        if let Some(payload) = &dr.payload {
            let content_type = match dr.encoding {
                BodyEncoding::Json => "application/json",
                BodyEncoding::Ssz | BodyEncoding::Octet => "application/octet-stream",
            };
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(payload.clone());
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok((status, body.to_vec()))
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{}", path.trim_start_matches('/'))
    }
}

fn rpc_error_code(body: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value.get("error")?.get("code")?.as_i64()
}

/// Short user-facing excerpt of an upstream body; JSON-RPC error messages
/// pass through whole.
fn excerpt(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.chars().count() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("{head}…")
    } else {
        trimmed.to_string()
    }
}
