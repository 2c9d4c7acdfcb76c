//! Query-parameter manipulation filter.
//!
//! Mutates the request's parsed query pairs in place. Operations targeting a
//! parameter that is not present are deliberate no-ops: a missing target is
//! an expected request shape, not a configuration fault.

use async_trait::async_trait;
use std::str::FromStr;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryOp {
    Add,
    Set,
    Remove,
    Rename,
}

impl FromStr for QueryOp {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(QueryOp::Add),
            "set" => Ok(QueryOp::Set),
            "remove" => Ok(QueryOp::Remove),
            "rename" => Ok(QueryOp::Rename),
            other => Err(GatewayError::validation(format!(
                "unknown query parameter operation '{other}'"
            ))),
        }
    }
}

pub struct QueryParamFilter {
    base: BaseFilter,
    op: QueryOp,
    name: String,
    value: Option<String>,
    rename_to: Option<String>,
}

impl QueryParamFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        let op = QueryOp::from_str(&config.required_str(&[
            "modifierType",
            "modifier_type",
            "op",
        ])?)?;
        let name = config.required_str(&["paramName", "param_name"])?;
        let value = config
            .param_str(&["paramValue", "param_value"])
            .map(str::to_string);
        let rename_to = config
            .param_str(&["targetParamName", "target_param_name"])
            .map(str::to_string);

        if matches!(op, QueryOp::Add | QueryOp::Set) && value.is_none() {
            return Err(GatewayError::validation(format!(
                "query parameter operation on '{name}' requires 'paramValue'"
            )));
        }
        if op == QueryOp::Rename && rename_to.is_none() {
            return Err(GatewayError::validation(
                "query parameter rename requires 'targetParamName'",
            ));
        }

        Ok(Self {
            base: BaseFilter::from_config(FilterType::QueryParam, config, FilterAction::PreRouting),
            op,
            name,
            value,
            rename_to,
        })
    }
}

#[async_trait]
impl Filter for QueryParamFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    async fn apply(&self, ctx: &mut RequestContext) -> GatewayResult<()> {
        match self.op {
            QueryOp::Add => {
                if let Some(value) = &self.value {
                    ctx.query.push((self.name.clone(), value.clone()));
                }
            }
            QueryOp::Set => {
                // Collapses duplicates to a single occurrence; absent
                // parameter means nothing to set.
                if ctx.query.iter().any(|(k, _)| k == &self.name) {
                    if let Some(value) = &self.value {
                        ctx.query.retain(|(k, _)| k != &self.name);
                        ctx.query.push((self.name.clone(), value.clone()));
                    }
                }
            }
            QueryOp::Remove => {
                ctx.query.retain(|(k, _)| k != &self.name);
            }
            QueryOp::Rename => {
                if let Some(target) = &self.rename_to {
                    for (k, _) in ctx.query.iter_mut() {
                        if k == &self.name {
                            *k = target.clone();
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn filter(op: &str, extra: &[(&str, &str)]) -> QueryParamFilter {
        let mut config = FilterConfig::new("query-param")
            .with_param("modifierType", op)
            .with_param("paramName", "page");
        for (k, v) in extra {
            config = config.with_param(*k, *v);
        }
        QueryParamFilter::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_add_appends_and_set_collapses() {
        let mut ctx = RequestContext::new(Method::GET, "/users?page=1&page=2");

        filter("add", &[("paramValue", "3")]).apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.query.iter().filter(|(k, _)| k == "page").count(), 3);

        filter("set", &[("paramValue", "9")]).apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.query_param("page"), Some("9"));
        assert_eq!(ctx.query.iter().filter(|(k, _)| k == "page").count(), 1);
    }

    #[tokio::test]
    async fn test_missing_target_is_a_no_op() {
        let mut ctx = RequestContext::new(Method::GET, "/users?limit=10");
        let before = ctx.query.clone();

        filter("set", &[("paramValue", "9")]).apply(&mut ctx).await.unwrap();
        filter("remove", &[]).apply(&mut ctx).await.unwrap();
        filter("rename", &[("targetParamName", "p")])
            .apply(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.query, before);
    }

    #[tokio::test]
    async fn test_rename_renames_every_occurrence() {
        let mut ctx = RequestContext::new(Method::GET, "/users?page=1&page=2");
        filter("rename", &[("targetParamName", "p")])
            .apply(&mut ctx)
            .await
            .unwrap();
        assert!(ctx.query_param("page").is_none());
        assert_eq!(ctx.query.iter().filter(|(k, _)| k == "p").count(), 2);
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let config = FilterConfig::new("query-param")
            .with_param("modifierType", "upsert")
            .with_param("paramName", "page");
        assert!(QueryParamFilter::from_config(config).is_err());
    }
}
