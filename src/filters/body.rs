//! Body manipulation and validation filter.
//!
//! Enforces a size ceiling before anything else, then skips quietly when the
//! content type is outside the configured allowlist: a mismatched content
//! type means the filter does not apply, not that the request is broken.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};

/// Size ceiling applied when the configuration sets none.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

const DEFAULT_ALLOWED_CONTENT_TYPES: [&str; 4] = [
    "application/json",
    "text/plain",
    "application/xml",
    "application/x-www-form-urlencoded",
];

#[derive(Debug, Clone)]
enum BodyOp {
    /// Replace every occurrence of a substring.
    Replace { from: String, to: String },
    /// Overwrite the body wholesale.
    Set(String),
    /// Reject bodies that are not well-formed JSON.
    ValidateJson,
}

pub struct BodyFilter {
    base: BaseFilter,
    op: BodyOp,
    max_bytes: usize,
    allowed_content_types: Vec<String>,
}

impl BodyFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let mode = config.required_str(&["mode", "modifierType", "modifier_type"])?;
        let op = match mode.as_str() {
            "replace" => BodyOp::Replace {
                from: config.required_str(&["from"])?,
                to: config.required_str(&["to"])?,
            },
            "set" => BodyOp::Set(config.required_str(&["content", "body"])?),
            "validate-json" | "validate_json" | "validateJson" => BodyOp::ValidateJson,
            other => {
                return Err(GatewayError::validation(format!(
                    "unknown body filter mode '{other}'"
                )))
            }
        };

        let max_bytes = config
            .param_usize(&["maxBodySize", "max_body_size", "maxSize", "max_size"])
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let allowed_content_types = config
            .param_str_list(&["allowedContentTypes", "allowed_content_types"])
            .unwrap_or_else(|| {
                DEFAULT_ALLOWED_CONTENT_TYPES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        Ok(Self {
            base: BaseFilter::from_config(FilterType::Body, config, FilterAction::PreRouting),
            op,
            max_bytes,
            allowed_content_types,
        })
    }

    /// Content-type allowlist check; parameters after `;` are ignored.
    fn content_type_allowed(&self, content_type: Option<&str>) -> bool {
        let Some(raw) = content_type else {
            // Absent content type is treated as applicable; the operation
            // itself decides whether the bytes make sense.
            return true;
        };
        let essence = raw.split(';').next().unwrap_or(raw).trim();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }

    fn transform(&self, body: &Bytes) -> GatewayResult<Option<Bytes>> {
        match &self.op {
            BodyOp::Replace { from, to } => {
                let text = std::str::from_utf8(body).map_err(|_| {
                    GatewayError::filter(self.base.name.clone(), "body is not valid UTF-8")
                })?;
                if !text.contains(from.as_str()) {
                    return Ok(None);
                }
                Ok(Some(Bytes::from(text.replace(from.as_str(), to))))
            }
            BodyOp::Set(content) => Ok(Some(Bytes::from(content.clone()))),
            BodyOp::ValidateJson => {
                serde_json::from_slice::<Value>(body).map_err(|e| {
                    GatewayError::filter(
                        self.base.name.clone(),
                        format!("body is not valid JSON: {e}"),
                    )
                })?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Filter for BodyFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        let on_response = self.base.action == FilterAction::PreResponse;
        let (size, content_type) = if on_response {
            let response = ctx.response_mut();
            let content_type = response
                .headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            (response.body.len(), content_type)
        } else {
            (ctx.body.len(), ctx.header("content-type").map(str::to_string))
        };

        if size > self.max_bytes {
            return Err(GatewayError::BodyTooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        if !self.content_type_allowed(content_type.as_deref()) {
            debug!(
                filter = %self.base.name,
                content_type = content_type.as_deref().unwrap_or(""),
                "content type outside allowlist, skipping body filter"
            );
            return Ok(());
        }

        let current = if on_response {
            ctx.response_mut().body.clone()
        } else {
            ctx.body.clone()
        };
        if let Some(new_body) = self.transform(&current)? {
            if on_response {
                ctx.response_mut().body = new_body;
            } else {
                ctx.body = new_body;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method};

    fn json_ctx(body: &str) -> RequestContext {
        let mut ctx = RequestContext::new(Method::POST, "/users");
        ctx.headers
            .insert("content-type", HeaderValue::from_static("application/json"));
        ctx.body = Bytes::from(body.to_string());
        ctx
    }

    #[tokio::test]
    async fn test_replace_rewrites_every_occurrence() {
        let config = FilterConfig::new("body")
            .with_param("mode", "replace")
            .with_param("from", "v1")
            .with_param("to", "v2");
        let filter = BodyFilter::from_config(config).unwrap();

        let mut ctx = json_ctx(r#"{"a":"v1","b":"v1"}"#);
        filter.apply(&mut ctx).await.unwrap();
        assert_eq!(&ctx.body[..], br#"{"a":"v2","b":"v2"}"#);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_before_transforming() {
        let config = FilterConfig::new("body")
            .with_param("mode", "set")
            .with_param("content", "x")
            .with_param("maxBodySize", 4);
        let filter = BodyFilter::from_config(config).unwrap();

        let mut ctx = json_ctx("12345");
        let err = filter.apply(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::BodyTooLarge { size: 5, limit: 4 }
        ));
        assert_eq!(&ctx.body[..], b"12345");
    }

    #[tokio::test]
    async fn test_disallowed_content_type_skips_quietly() {
        let config = FilterConfig::new("body")
            .with_param("mode", "validate-json")
            .with_param("allowedContentTypes", "application/json");
        let filter = BodyFilter::from_config(config).unwrap();

        let mut ctx = RequestContext::new(Method::POST, "/upload");
        ctx.headers.insert(
            "content-type",
            HeaderValue::from_static("application/octet-stream"),
        );
        ctx.body = Bytes::from_static(b"\x00\x01not json");
        filter.apply(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_json_rejects_malformed_body() {
        let config = FilterConfig::new("body").with_param("mode", "validate-json");
        let filter = BodyFilter::from_config(config).unwrap();

        let mut ok = json_ctx(r#"{"valid": true}"#);
        filter.apply(&mut ok).await.unwrap();

        let mut bad = json_ctx(r#"{"valid": "#);
        let err = filter.apply(&mut bad).await.unwrap_err();
        assert!(matches!(err, GatewayError::Filter { .. }));
    }

    #[tokio::test]
    async fn test_pre_response_action_mutates_response_body() {
        let config = FilterConfig::new("body")
            .with_param("mode", "replace")
            .with_param("from", "internal-host")
            .with_param("to", "gateway")
            .with_action(FilterAction::PreResponse);
        let filter = BodyFilter::from_config(config).unwrap();

        let mut ctx = RequestContext::new(Method::GET, "/users");
        let response = ctx.response_mut();
        response
            .headers
            .insert("content-type", HeaderValue::from_static("application/json"));
        response.body = Bytes::from_static(b"{\"host\":\"internal-host\"}");

        filter.apply(&mut ctx).await.unwrap();
        assert_eq!(&ctx.response_mut().body[..], b"{\"host\":\"gateway\"}");
    }
}
