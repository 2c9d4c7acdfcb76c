//! Response filter extension point.
//!
//! Carries only the base fields and inherits the trait's no-op `apply`;
//! deployments attach behavior by placing concrete filters (header, body,
//! cookie) in the pre-response phase instead. Kept as a distinct type so
//! configurations can declare the slot explicitly.

use crate::core::error::GatewayResult;
use crate::filters::{BaseFilter, Filter, FilterAction, FilterConfig, FilterType};

pub struct ResponseFilter {
    base: BaseFilter,
}

impl ResponseFilter {
    pub fn from_config(config: FilterConfig) -> GatewayResult<Self> {
        Ok(Self {
            base: BaseFilter::from_config(FilterType::Response, config, FilterAction::PreResponse),
        })
    }
}

impl Filter for ResponseFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RequestContext;
    use axum::http::Method;

    #[tokio::test]
    async fn test_defaults_to_pre_response_and_leaves_context_untouched() {
        let filter = ResponseFilter::from_config(FilterConfig::new("response")).unwrap();
        assert_eq!(filter.action(), FilterAction::PreResponse);

        let mut ctx = RequestContext::new(Method::GET, "/users?a=1");
        let path = ctx.path.clone();
        filter.apply(&mut ctx).await.unwrap();
        assert_eq!(ctx.path, path);
        assert!(ctx.response.is_none());
    }
}
