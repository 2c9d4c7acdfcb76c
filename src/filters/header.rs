//! Header manipulation filter.
//!
//! Adds, sets, removes, or renames a header on either the request or the
//! response side. Header names and values are validated at construction so
//! a malformed configuration fails at load time, not per request.

use async_trait::async_trait;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::HeaderMap;
use std::str::FromStr;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderOp {
    Add,
    Set,
    Remove,
    Rename,
}

impl FromStr for HeaderOp {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(HeaderOp::Add),
            "set" => Ok(HeaderOp::Set),
            "remove" => Ok(HeaderOp::Remove),
            "rename" => Ok(HeaderOp::Rename),
            other => Err(GatewayError::validation(format!(
                "unknown header operation '{other}'"
            ))),
        }
    }
}

/// Which side of the exchange the filter mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderTarget {
    Request,
    Response,
}

pub struct HeaderFilter {
    base: BaseFilter,
    op: HeaderOp,
    name: HeaderName,
    value: Option<HeaderValue>,
    rename_to: Option<HeaderName>,
    target: HeaderTarget,
}

impl HeaderFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let op = HeaderOp::from_str(&config.required_str(&[
            "op",
            "operation",
            "modifierType",
            "modifier_type",
        ])?)?;

        let raw_name = config.required_str(&["headerName", "header_name"])?;
        let name = HeaderName::from_str(&raw_name)
            .map_err(|_| GatewayError::validation(format!("invalid header name '{raw_name}'")))?;

        let value = match config.param_str(&["headerValue", "header_value"]) {
            Some(raw) => Some(HeaderValue::from_str(raw).map_err(|_| {
                GatewayError::validation(format!("invalid header value for '{raw_name}'"))
            })?),
            None => None,
        };
        if matches!(op, HeaderOp::Add | HeaderOp::Set) && value.is_none() {
            return Err(GatewayError::validation(format!(
                "header operation '{raw_name}' requires 'headerValue'"
            )));
        }

        let rename_to = match config.param_str(&["targetHeaderName", "target_header_name"]) {
            Some(raw) => Some(HeaderName::from_str(raw).map_err(|_| {
                GatewayError::validation(format!("invalid target header name '{raw}'"))
            })?),
            None => None,
        };
        if op == HeaderOp::Rename && rename_to.is_none() {
            return Err(GatewayError::validation(
                "header rename requires 'targetHeaderName'",
            ));
        }

        // Explicit target wins; otherwise response-phase placement implies
        // response headers.
        let explicit_target = match config.param_str(&["target"]) {
            Some("request") => Some(HeaderTarget::Request),
            Some("response") => Some(HeaderTarget::Response),
            Some(other) => {
                return Err(GatewayError::validation(format!(
                    "unknown header target '{other}'"
                )))
            }
            None => None,
        };
        let base = BaseFilter::from_config(FilterType::Header, config, FilterAction::PreRouting);
        let target = explicit_target.unwrap_or(if base.action == FilterAction::PreResponse {
            HeaderTarget::Response
        } else {
            HeaderTarget::Request
        });

        Ok(Self {
            base,
            op,
            name,
            value,
            rename_to,
            target,
        })
    }

    fn mutate(&self, headers: &mut HeaderMap) {
        match self.op {
            HeaderOp::Add => {
                if let Some(value) = &self.value {
                    headers.append(self.name.clone(), value.clone());
                }
            }
            HeaderOp::Set => {
                if let Some(value) = &self.value {
                    headers.insert(self.name.clone(), value.clone());
                }
            }
            HeaderOp::Remove => {
                headers.remove(&self.name);
            }
            HeaderOp::Rename => {
                // Absent source header leaves the map untouched.
                if let Some(value) = headers.remove(&self.name) {
                    if let Some(target) = &self.rename_to {
                        headers.insert(target.clone(), value);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Filter for HeaderFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        match self.target {
            HeaderTarget::Request => self.mutate(&mut ctx.headers),
            HeaderTarget::Response => self.mutate(&mut ctx.response_mut().headers),
        }
        Ok(())
    }
}
