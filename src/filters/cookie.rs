//! Cookie manipulation filter.
//!
//! Request-phase application rewrites the `Cookie` header pairs in place.
//! When a request-phase filter needs to influence the eventual response
//! (e.g. clearing a cookie at the client), it records the operation in the
//! context under `CTX_RESPONSE_COOKIE_OPS`; `apply_deferred_cookie_ops`
//! drains those records into `Set-Cookie` headers once a response exists.

use async_trait::async_trait;
use axum::http::header::{HeaderValue, COOKIE, SET_COOKIE};
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::warn;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{RequestContext, CTX_RESPONSE_COOKIE_OPS};
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CookieOp {
    Add,
    Remove,
    Modify,
    /// Require the cookie to be present (optionally matching a pattern).
    Validate,
    /// Keep only allow-listed cookies, dropping the rest.
    Filter,
}

impl CookieOp {
    fn as_str(&self) -> &'static str {
        match self {
            CookieOp::Add => "add",
            CookieOp::Remove => "remove",
            CookieOp::Modify => "modify",
            CookieOp::Validate => "validate",
            CookieOp::Filter => "filter",
        }
    }
}

impl FromStr for CookieOp {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(CookieOp::Add),
            "remove" => Ok(CookieOp::Remove),
            "modify" | "set" => Ok(CookieOp::Modify),
            "validate" => Ok(CookieOp::Validate),
            "filter" => Ok(CookieOp::Filter),
            other => Err(GatewayError::validation(format!(
                "unknown cookie operation '{other}'"
            ))),
        }
    }
}

pub struct CookieFilter {
    base: BaseFilter,
    op: CookieOp,
    name: String,
    value: Option<String>,
    /// `validate` only: the cookie value must match this pattern.
    value_pattern: Option<regex::Regex>,
    /// `filter` only: cookies that survive.
    allowed: Vec<String>,
    /// Mirror the mutation to the client via a deferred `Set-Cookie`.
    reflect_to_response: bool,
}

impl CookieFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let op = CookieOp::from_str(&config.required_str(&[
            "op",
            "operation",
            "modifierType",
            "modifier_type",
        ])?)?;

        let allowed = config
            .param_str_list(&["allowedCookies", "allowed_cookies"])
            .unwrap_or_default();
        if op == CookieOp::Filter && allowed.is_empty() {
            return Err(GatewayError::validation(
                "cookie filter operation requires 'allowedCookies'",
            ));
        }

        let name = if op == CookieOp::Filter {
            config
                .param_str(&["cookieName", "cookie_name"])
                .unwrap_or_default()
                .to_string()
        } else {
            config.required_str(&["cookieName", "cookie_name"])?
        };
        let value = config
            .param_str(&["cookieValue", "cookie_value"])
            .map(str::to_string);
        if matches!(op, CookieOp::Add | CookieOp::Modify) && value.is_none() {
            return Err(GatewayError::validation(format!(
                "cookie operation on '{name}' requires 'cookieValue'"
            )));
        }
        let value_pattern = match config.param_str(&["valuePattern", "value_pattern"]) {
            Some(raw) => Some(regex::Regex::new(raw).map_err(|e| {
                GatewayError::validation(format!("invalid cookie value pattern '{raw}': {e}"))
            })?),
            None => None,
        };
        let reflect_to_response = config
            .param_bool(&["reflectToResponse", "reflect_to_response"])
            .unwrap_or(false);

        Ok(Self {
            base: BaseFilter::from_config(FilterType::Cookie, config, FilterAction::PreRouting),
            op,
            name,
            value,
            value_pattern,
            allowed,
            reflect_to_response,
        })
    }

    /// `validate`: the cookie must be present, and match the configured
    /// pattern when one is set. Always runs against the request header.
    fn validate(&self, ctx: &RequestContext) -> GatewayResult<()> {
        let pairs = parse_cookie_pairs(ctx.header(COOKIE.as_str()).unwrap_or_default());
        let found = pairs.iter().find(|(k, _)| k == &self.name);
        match found {
            None => Err(GatewayError::filter(
                self.base.name.clone(),
                format!("required cookie '{}' is missing", self.name),
            )),
            Some((_, v)) => match &self.value_pattern {
                Some(pattern) if !pattern.is_match(v) => Err(GatewayError::filter(
                    self.base.name.clone(),
                    format!("cookie '{}' does not match the expected pattern", self.name),
                )),
                _ => Ok(()),
            },
        }
    }

    /// Rewrite the request's `Cookie` header pairs.
    fn mutate_request(&self, ctx: &mut RequestContext) {
        let mut pairs = parse_cookie_pairs(ctx.header(COOKIE.as_str()).unwrap_or_default());
        match self.op {
            CookieOp::Add => {
                if let Some(value) = &self.value {
                    pairs.push((self.name.clone(), value.clone()));
                }
            }
            CookieOp::Remove => {
                pairs.retain(|(k, _)| k != &self.name);
            }
            CookieOp::Modify => {
                // Absent cookie means nothing to modify.
                if let Some(value) = &self.value {
                    for (k, v) in pairs.iter_mut() {
                        if k == &self.name {
                            *v = value.clone();
                        }
                    }
                }
            }
            CookieOp::Filter => {
                pairs.retain(|(k, _)| self.allowed.iter().any(|a| a == k));
            }
            // Handled before mutation; nothing to rewrite.
            CookieOp::Validate => {}
        }

        if pairs.is_empty() {
            ctx.headers.remove(COOKIE);
            return;
        }
        let joined = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        match HeaderValue::from_str(&joined) {
            Ok(header) => {
                ctx.headers.insert(COOKIE, header);
            }
            Err(_) => {
                warn!(cookie = %self.name, "rewritten cookie header is not a valid header value");
            }
        }
    }

    /// Record a deferred response-side operation in the context.
    fn record_response_op(&self, ctx: &mut RequestContext) {
        let record = json!({
            "op": self.op.as_str(),
            "name": self.name,
            "value": self.value,
        });
        match ctx.data.get_mut(CTX_RESPONSE_COOKIE_OPS) {
            Some(Value::Array(ops)) => ops.push(record),
            _ => {
                ctx.data
                    .insert(CTX_RESPONSE_COOKIE_OPS.to_string(), Value::Array(vec![record]));
            }
        }
    }

    fn apply_to_response(&self, ctx: &mut RequestContext) {
        append_set_cookie(
            ctx,
            self.op,
            &self.name,
            self.value.as_deref().unwrap_or_default(),
        );
    }
}

#[async_trait]
impl Filter for CookieFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        // Validation never mutates and always inspects the request side.
        if self.op == CookieOp::Validate {
            return self.validate(ctx);
        }
        if self.base.action == FilterAction::PreResponse {
            self.apply_to_response(ctx);
            return Ok(());
        }
        self.mutate_request(ctx);
        if self.reflect_to_response && !matches!(self.op, CookieOp::Filter) {
            self.record_response_op(ctx);
        }
        Ok(())
    }
}

/// Drain operations recorded under `CTX_RESPONSE_COOKIE_OPS` into
/// `Set-Cookie` headers on the response. Call once the upstream response is
/// available, before the pre-response phase runs.
pub fn apply_deferred_cookie_ops(ctx: &mut RequestContext) -> GatewayResult<()> {
    let Some(Value::Array(ops)) = ctx.data.remove(CTX_RESPONSE_COOKIE_OPS) else {
        return Ok(());
    };
    for record in ops {
        let op = record
            .get("op")
            .and_then(Value::as_str)
            .map(CookieOp::from_str)
            .transpose()?
            .ok_or_else(|| GatewayError::internal("malformed deferred cookie operation"))?;
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::internal("deferred cookie operation missing name"))?
            .to_string();
        let value = record
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        append_set_cookie(ctx, op, &name, &value);
    }
    Ok(())
}

fn append_set_cookie(ctx: &mut RequestContext, op: CookieOp, name: &str, value: &str) {
    let cookie = match op {
        CookieOp::Add | CookieOp::Modify => format!("{name}={value}; Path=/"),
        // Expire immediately to clear the cookie at the client.
        CookieOp::Remove => format!("{name}=; Path=/; Max-Age=0"),
        // Inspection-only operations never render a Set-Cookie.
        CookieOp::Validate | CookieOp::Filter => return,
    };
    match HeaderValue::from_str(&cookie) {
        Ok(header) => {
            ctx.response_mut().headers.append(SET_COOKIE, header);
        }
        Err(_) => {
            warn!(cookie = %name, "set-cookie value is not a valid header value");
        }
    }
}

fn parse_cookie_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((k, v)) => Some((k.trim().to_string(), v.trim().to_string())),
                None => Some((pair.to_string(), String::new())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn cookie_filter(op: &str, extra: &[(&str, &str)]) -> CookieFilter {
        let mut config = FilterConfig::new("cookie")
            .with_param("op", op)
            .with_param("cookieName", "session");
        for (k, v) in extra {
            config = config.with_param(*k, *v);
        }
        CookieFilter::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_add_and_remove_rewrite_cookie_header() {
        let mut ctx = RequestContext::new(Method::GET, "/users");
        ctx.headers
            .insert(COOKIE, HeaderValue::from_static("theme=dark"));

        cookie_filter("add", &[("cookieValue", "abc123")])
            .apply(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.header("cookie"), Some("theme=dark; session=abc123"));

        cookie_filter("remove", &[]).apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.header("cookie"), Some("theme=dark"));
    }

    #[tokio::test]
    async fn test_modify_leaves_absent_cookie_untouched() {
        let mut ctx = RequestContext::new(Method::GET, "/users");
        ctx.headers
            .insert(COOKIE, HeaderValue::from_static("theme=dark"));

        cookie_filter("modify", &[("cookieValue", "x")])
            .apply(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.header("cookie"), Some("theme=dark"));
    }

    #[tokio::test]
    async fn test_removing_last_cookie_drops_the_header() {
        let mut ctx = RequestContext::new(Method::GET, "/users");
        ctx.headers
            .insert(COOKIE, HeaderValue::from_static("session=abc"));

        cookie_filter("remove", &[]).apply(&mut ctx).await.unwrap();
        assert!(ctx.header("cookie").is_none());
    }

    #[tokio::test]
    async fn test_validate_requires_presence_and_pattern() {
        let mut ctx = RequestContext::new(Method::GET, "/users");
        ctx.headers
            .insert(COOKIE, HeaderValue::from_static("session=abc123"));

        cookie_filter("validate", &[]).apply(&mut ctx).await.unwrap();

        let strict = cookie_filter("validate", &[("valuePattern", "^[0-9]+$")]);
        let err = strict.apply(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Filter { .. }));

        ctx.headers.remove(COOKIE);
        let err = cookie_filter("validate", &[]).apply(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::Filter { .. }));
    }

    #[tokio::test]
    async fn test_filter_keeps_only_allowed_cookies() {
        let config = FilterConfig::new("cookie")
            .with_param("op", "filter")
            .with_param("allowedCookies", "session, theme");
        let filter = CookieFilter::from_config(config).unwrap();

        let mut ctx = RequestContext::new(Method::GET, "/users");
        ctx.headers.insert(
            COOKIE,
            HeaderValue::from_static("session=abc; tracker=xyz; theme=dark"),
        );
        filter.apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.header("cookie"), Some("session=abc; theme=dark"));
    }

    #[test]
    fn test_filter_without_allowlist_is_rejected() {
        let config = FilterConfig::new("cookie").with_param("op", "filter");
        assert!(CookieFilter::from_config(config).is_err());
    }

    #[tokio::test]
    async fn test_deferred_ops_become_set_cookie_headers() {
        let mut ctx = RequestContext::new(Method::GET, "/users");
        cookie_filter("remove", &[("reflectToResponse", "unused")])
            .apply(&mut ctx)
            .await
            .unwrap();
        // reflectToResponse only counts when it is a boolean true.
        assert!(!ctx.data.contains_key(CTX_RESPONSE_COOKIE_OPS));

        let mut config = FilterConfig::new("cookie")
            .with_param("op", "remove")
            .with_param("cookieName", "session");
        config = config.with_param("reflectToResponse", true);
        let filter = CookieFilter::from_config(config).unwrap();
        filter.apply(&mut ctx).await.unwrap();
        assert!(ctx.data.contains_key(CTX_RESPONSE_COOKIE_OPS));

        apply_deferred_cookie_ops(&mut ctx).unwrap();
        assert!(!ctx.data.contains_key(CTX_RESPONSE_COOKIE_OPS));
        let set_cookie = ctx.response_mut().headers.get(SET_COOKIE).unwrap();
        assert_eq!(set_cookie.to_str().unwrap(), "session=; Path=/; Max-Age=0");
    }

    #[tokio::test]
    async fn test_pre_response_action_appends_set_cookie_directly() {
        let config = FilterConfig::new("cookie")
            .with_param("op", "add")
            .with_param("cookieName", "region")
            .with_param("cookieValue", "eu")
            .with_action(FilterAction::PreResponse);
        let filter = CookieFilter::from_config(config).unwrap();

        let mut ctx = RequestContext::new(Method::GET, "/users");
        filter.apply(&mut ctx).await.unwrap();
        let set_cookie = ctx.response_mut().headers.get(SET_COOKIE).unwrap();
        assert_eq!(set_cookie.to_str().unwrap(), "region=eu; Path=/");
    }
}
