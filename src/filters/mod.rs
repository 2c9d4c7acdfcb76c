//! # Filter Framework
//!
//! A staged, ordered set of mutators/validators applied to in-flight
//! requests and responses. Filters are grouped by execution phase
//! (`FilterAction`), sorted within a phase by descending priority, and run
//! sequentially; an error aborts the remaining filters of that phase and
//! surfaces to the caller rather than being swallowed.
//!
//! Every concrete filter composes one `BaseFilter` carrying the common
//! fields; the trait's accessors default-delegate to it, and `apply` defaults
//! to a no-op so extension-point filters need nothing but the base.

pub mod body;
pub mod config;
pub mod cookie;
pub mod header;
pub mod method;
pub mod path;
pub mod query;
pub mod response;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::RequestContext;

pub use body::BodyFilter;
pub use config::{FilterConfig, FilterFactory};
pub use cookie::{apply_deferred_cookie_ops, CookieFilter};
pub use header::HeaderFilter;
pub use method::MethodFilter;
pub use path::{PathRewriteFilter, StripPrefixFilter};
pub use query::QueryParamFilter;
pub use response::ResponseFilter;

/// Execution phase of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterAction {
    /// Before the route/upstream is resolved.
    PreRouting,
    /// After routing, before the upstream call.
    PostRouting,
    /// After the upstream response, before it is sent to the client.
    PreResponse,
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterAction::PreRouting => write!(f, "pre-routing"),
            FilterAction::PostRouting => write!(f, "post-routing"),
            FilterAction::PreResponse => write!(f, "pre-response"),
        }
    }
}

/// Concrete filter kind selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterType {
    Header,
    QueryParam,
    Body,
    Cookie,
    Method,
    StripPrefix,
    PathRewrite,
    Response,
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterType::Header => write!(f, "header"),
            FilterType::QueryParam => write!(f, "query-param"),
            FilterType::Body => write!(f, "body"),
            FilterType::Cookie => write!(f, "cookie"),
            FilterType::Method => write!(f, "method"),
            FilterType::StripPrefix => write!(f, "strip-prefix"),
            FilterType::PathRewrite => write!(f, "path-rewrite"),
            FilterType::Response => write!(f, "response"),
        }
    }
}

impl FromStr for FilterType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "header" => Ok(FilterType::Header),
            "query-param" | "query_param" => Ok(FilterType::QueryParam),
            "body" => Ok(FilterType::Body),
            "cookie" => Ok(FilterType::Cookie),
            "method" => Ok(FilterType::Method),
            "strip-prefix" | "strip_prefix" => Ok(FilterType::StripPrefix),
            "path-rewrite" | "path_rewrite" => Ok(FilterType::PathRewrite),
            "response" => Ok(FilterType::Response),
            other => Err(GatewayError::unsupported(format!("filter type '{other}'"))),
        }
    }
}

/// Default priority applied when a configuration leaves `order` unset or
/// non-positive.
pub const DEFAULT_FILTER_PRIORITY: i32 = 100;

/// Common fields shared by every filter, built once from its configuration.
#[derive(Debug, Clone)]
pub struct BaseFilter {
    name: String,
    filter_type: FilterType,
    action: FilterAction,
    priority: i32,
    enabled: bool,
    /// The original configuration, preserved verbatim for introspection.
    config: FilterConfig,
}

impl BaseFilter {
    /// Build the base from a configuration. `default_action` applies when the
    /// configuration carries no explicit action.
    pub fn from_config(
        filter_type: FilterType,
        config: FilterConfig,
        default_action: FilterAction,
    ) -> Self {
        let priority = if config.order > 0 {
            config.order
        } else {
            DEFAULT_FILTER_PRIORITY
        };
        Self {
            name: if config.name.is_empty() {
                config.id.clone()
            } else {
                config.name.clone()
            },
            filter_type,
            action: config.action.unwrap_or(default_action),
            priority,
            enabled: config.enabled,
            config,
        }
    }
}

/// Capability shared by all filters.
#[async_trait]
pub trait Filter: Send + Sync {
    /// The shared base; accessors below delegate to it.
    fn base(&self) -> &BaseFilter;

    /// Apply the filter to an in-flight request. Defaults to a no-op so
    /// extension-point filters only need a `BaseFilter`.
    async fn apply(&self, _ctx: &mut RequestContext) -> GatewayResult<()> {
        Ok(())
    }

    fn filter_type(&self) -> FilterType {
        self.base().filter_type
    }

    fn action(&self) -> FilterAction {
        self.base().action
    }

    /// Ordering within a phase; higher runs first.
    fn priority(&self) -> i32 {
        self.base().priority
    }

    fn is_enabled(&self) -> bool {
        self.base().enabled
    }

    fn name(&self) -> &str {
        &self.base().name
    }

    /// The configuration this filter was built from.
    fn config(&self) -> &FilterConfig {
        &self.base().config
    }
}

impl std::fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").field("name", &self.name()).finish()
    }
}

/// Ordered set of filters executed phase by phase.
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field(
                "filters",
                &self.filters.iter().map(|x| x.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// Build a chain from declarative configurations via the factory.
    pub fn from_configs(configs: Vec<FilterConfig>) -> GatewayResult<Self> {
        let mut filters = Vec::with_capacity(configs.len());
        for config in configs {
            filters.push(FilterFactory::create_filter(config)?);
        }
        Ok(Self::new(filters))
    }

    /// Enabled filters of one phase, ordered by descending priority.
    fn phase_filters(&self, action: FilterAction) -> Vec<&Arc<dyn Filter>> {
        let mut selected: Vec<&Arc<dyn Filter>> = self
            .filters
            .iter()
            .filter(|f| f.is_enabled() && f.action() == action)
            .collect();
        // Stable sort: equal priorities keep registration order.
        selected.sort_by_key(|f| std::cmp::Reverse(f.priority()));
        selected
    }

    /// Run one phase sequentially, fail-fast: the first error aborts the
    /// remaining filters of this phase and propagates to the caller.
    pub async fn execute_phase(
        &self,
        action: FilterAction,
        ctx: &mut RequestContext,
    ) -> GatewayResult<()> {
        for filter in self.phase_filters(action) {
            debug!(
                filter = filter.name(),
                filter_type = %filter.filter_type(),
                phase = %action,
                "applying filter"
            );
            if let Err(err) = filter.apply(ctx).await {
                warn!(
                    filter = filter.name(),
                    phase = %action,
                    error = %err,
                    "filter failed, aborting phase"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
