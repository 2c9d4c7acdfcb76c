//! HTTP method allow/deny filter.
//!
//! Rejection does not abort the chain: the filter records
//! `CTX_METHOD_REJECTED` and a computed `Allow` header value in the context
//! and lets the handler turn those into a 405. `OPTIONS` requests are
//! short-circuited with the same `Allow` value so clients can probe the
//! policy.

use async_trait::async_trait;
use axum::http::Method;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{
    RequestContext, CTX_ALLOW_HEADER, CTX_METHOD_REJECTED, CTX_OPTIONS_SHORT_CIRCUIT,
};
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};
use serde_json::Value;

const STANDARD_METHODS: [&str; 7] = ["GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodMode {
    Allow,
    Deny,
}

pub struct MethodFilter {
    base: BaseFilter,
    mode: MethodMode,
    methods: Vec<Method>,
}

impl MethodFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let allowed = config.param_str_list(&["allowedMethods", "allowed_methods"]);
        let denied = config.param_str_list(&["deniedMethods", "denied_methods"]);
        let (mode, raw_methods) = match (allowed, denied) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::validation(
                    "method filter accepts either 'allowedMethods' or 'deniedMethods', not both",
                ))
            }
            (Some(list), None) => (MethodMode::Allow, list),
            (None, Some(list)) => (MethodMode::Deny, list),
            (None, None) => {
                return Err(GatewayError::validation(
                    "method filter requires 'allowedMethods' or 'deniedMethods'",
                ))
            }
        };
        if raw_methods.is_empty() {
            return Err(GatewayError::validation(
                "method filter requires at least one method",
            ));
        }

        let mut methods = Vec::with_capacity(raw_methods.len());
        for raw in &raw_methods {
            let upper = raw.to_ascii_uppercase();
            let method = Method::from_bytes(upper.as_bytes()).map_err(|_| {
                GatewayError::validation(format!("invalid HTTP method '{raw}'"))
            })?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }

        Ok(Self {
            base: BaseFilter::from_config(FilterType::Method, config, FilterAction::PreRouting),
            mode,
            methods,
        })
    }

    /// Value for the `Allow` header under this policy.
    fn allow_value(&self) -> String {
        match self.mode {
            MethodMode::Allow => self
                .methods
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            MethodMode::Deny => STANDARD_METHODS
                .iter()
                .copied()
                .filter(|m| !self.methods.iter().any(|d| d.as_str() == *m))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    fn rejects(&self, method: &Method) -> bool {
        match self.mode {
            MethodMode::Allow => !self.methods.contains(method),
            MethodMode::Deny => self.methods.contains(method),
        }
    }
}

#[async_trait]
impl Filter for MethodFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        if ctx.method == Method::OPTIONS {
            ctx.set_flag(CTX_OPTIONS_SHORT_CIRCUIT);
            ctx.set_value(CTX_ALLOW_HEADER, Value::String(self.allow_value()));
            return Ok(());
        }
        if self.rejects(&ctx.method) {
            ctx.set_flag(CTX_METHOD_REJECTED);
            ctx.set_value(CTX_ALLOW_HEADER, Value::String(self.allow_value()));
        }
        Ok(())
    }
}
