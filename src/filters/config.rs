//! Declarative filter configuration and the factory that turns it into
//! runnable filters.
//!
//! Free-form `config` keys accept both camelCase and snake_case spellings so
//! configurations authored against either convention load unchanged; lookups
//! try the given aliases in order and take the first hit.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::filters::{
    BodyFilter, CookieFilter, Filter, FilterAction, FilterType, HeaderFilter, MethodFilter,
    PathRewriteFilter, QueryParamFilter, ResponseFilter, StripPrefixFilter,
};

/// Declarative description of one filter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    pub id: String,
    pub name: String,
    /// Concrete kind. Mandatory; the factory rejects configurations
    /// without it.
    #[serde(rename = "type")]
    pub filter_type: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Priority within a phase; non-positive values fall back to the default.
    pub order: i32,
    /// Execution phase; each filter kind supplies its own default when unset.
    pub action: Option<FilterAction>,
    /// Kind-specific parameters.
    pub config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            filter_type: None,
            enabled: true,
            order: 0,
            action: None,
            config: Map::new(),
        }
    }
}

impl FilterConfig {
    pub fn new(filter_type: impl Into<String>) -> Self {
        Self {
            filter_type: Some(filter_type.into()),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_action(mut self, action: FilterAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Raw parameter under any of the given key aliases, first match wins.
    pub fn param(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|key| self.config.get(*key))
    }

    /// String parameter; non-string values under the key are ignored.
    pub fn param_str(&self, keys: &[&str]) -> Option<&str> {
        self.param(keys).and_then(Value::as_str)
    }

    pub fn param_bool(&self, keys: &[&str]) -> Option<bool> {
        self.param(keys).and_then(Value::as_bool)
    }

    pub fn param_usize(&self, keys: &[&str]) -> Option<usize> {
        self.param(keys)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }

    /// String-array parameter; accepts a JSON array of strings or a single
    /// comma-separated string.
    pub fn param_str_list(&self, keys: &[&str]) -> Option<Vec<String>> {
        match self.param(keys)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(joined) => Some(
                joined
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Mandatory string parameter; names the first alias in the error.
    pub fn required_str(&self, keys: &[&str]) -> GatewayResult<String> {
        self.param_str(keys)
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::validation(format!(
                    "filter '{}' requires parameter '{}'",
                    self.display_name(),
                    keys[0]
                ))
            })
    }

    fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else if !self.id.is_empty() {
            &self.id
        } else {
            "<unnamed>"
        }
    }
}

/// Builds filters from configuration. Stateless; every filter kind in
/// `FilterType` has a construction arm here.
pub struct FilterFactory;

impl FilterFactory {
    pub fn create_filter(config: FilterConfig) -> GatewayResult<Arc<dyn Filter>> {
        let type_name = config.filter_type.clone().ok_or_else(|| {
            GatewayError::validation(format!(
                "filter '{}' is missing the mandatory 'type' field",
                config.display_name()
            ))
        })?;
        let filter_type = FilterType::from_str(&type_name)?;
        debug!(filter = config.display_name(), %filter_type, "building filter");

        let filter: Arc<dyn Filter> = match filter_type {
            FilterType::Header => Arc::new(HeaderFilter::from_config(config)?),
            FilterType::QueryParam => Arc::new(QueryParamFilter::from_config(config)?),
            FilterType::Body => Arc::new(BodyFilter::from_config(config)?),
            FilterType::Cookie => Arc::new(CookieFilter::from_config(config)?),
            FilterType::Method => Arc::new(MethodFilter::from_config(config)?),
            FilterType::StripPrefix => Arc::new(StripPrefixFilter::from_config(config)?),
            FilterType::PathRewrite => Arc::new(PathRewriteFilter::from_config(config)?),
            FilterType::Response => Arc::new(ResponseFilter::from_config(config)?),
        };
        Ok(filter)
    }
}
