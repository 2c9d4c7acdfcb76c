//! Path rewriting filters.
//!
//! `StripPrefixFilter` removes a fixed leading segment before routing;
//! `PathRewriteFilter` does substring or regex rewrites. Regex patterns are
//! compiled at construction so an invalid pattern fails configuration
//! loading instead of every request.

use async_trait::async_trait;
use regex::Regex;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};

pub struct StripPrefixFilter {
    base: BaseFilter,
    prefix: String,
}

impl StripPrefixFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let prefix = config.required_str(&["prefix"])?;
        if !prefix.starts_with('/') {
            return Err(GatewayError::validation(format!(
                "strip-prefix requires an absolute prefix, got '{prefix}'"
            )));
        }
        Ok(Self {
            base: BaseFilter::from_config(FilterType::StripPrefix, config, FilterAction::PreRouting),
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Filter for StripPrefixFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        if let Some(rest) = ctx.path.strip_prefix(&self.prefix) {
            // Only strip on a segment boundary: /api must not match /apiary.
            ctx.path = if rest.is_empty() {
                "/".to_string()
            } else if rest.starts_with('/') {
                rest.to_string()
            } else {
                return Ok(());
            };
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RewriteMode {
    Simple,
    Regex,
}

pub struct PathRewriteFilter {
    base: BaseFilter,
    mode: RewriteMode,
    from: String,
    to: String,
    pattern: Option<Regex>,
}

impl PathRewriteFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let mode = match config.param_str(&["mode"]).unwrap_or("simple") {
            "simple" => RewriteMode::Simple,
            "regex" => RewriteMode::Regex,
            other => {
                return Err(GatewayError::validation(format!(
                    "unknown path rewrite mode '{other}'"
                )))
            }
        };
        let from = config.required_str(&["from", "pattern"])?;
        let to = config.required_str(&["to", "replacement"])?;
        let pattern = match mode {
            RewriteMode::Regex => Some(Regex::new(&from).map_err(|e| {
                GatewayError::validation(format!("invalid path rewrite pattern '{from}': {e}"))
            })?),
            RewriteMode::Simple => None,
        };

        Ok(Self {
            base: BaseFilter::from_config(FilterType::PathRewrite, config, FilterAction::PreRouting),
            mode,
            from,
            to,
            pattern,
        })
    }
}

#[async_trait]
impl Filter for PathRewriteFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        match self.mode {
            RewriteMode::Simple => {
                if ctx.path.contains(&self.from) {
                    ctx.path = ctx.path.replace(&self.from, &self.to);
                }
            }
            RewriteMode::Regex => {
                if let Some(pattern) = &self.pattern {
                    let rewritten = pattern.replace_all(&ctx.path, self.to.as_str());
                    if rewritten != ctx.path {
                        ctx.path = rewritten.into_owned();
                    }
                }
            }
        }
        Ok(())
    }
}
