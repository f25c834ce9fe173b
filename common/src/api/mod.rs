//! Typed option structs for the ledger facade and the REST surfaces.
//!
//! Every read/write operation takes its own fielded options struct; unknown
//! fields in a request body are a schema error.

use crate::{
    error::ModuleError,
    transaction::ObjectId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cursor direction over the 24-hex id key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    #[serde(rename = "asc")]
    IdAsc,
    #[serde(rename = "desc")]
    IdDesc,
}

impl SortOrder {
    /// Accept the legacy numeric form (+1 ascending, -1 descending).
    pub fn from_i8(v: i8) -> Self {
        if v < 0 {
            Self::IdDesc
        } else {
            Self::IdAsc
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PoolQueryOptions {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub constrained_size: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct BlockQueryOptions {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub constrained_size: Option<u64>,
    /// Return the flattened, re-sorted transactions instead of the blocks.
    #[serde(default)]
    pub bare_transaction: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct CombinedQueryOptions {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Keep only propagated (deliveryF=true) rows from the pool portion.
    #[serde(default)]
    pub exclude_nonpropagate: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct LastBlockOptions {
    #[serde(default)]
    pub tenant: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct OidQueryOptions {
    #[serde(default)]
    pub tenant: Option<String>,
    /// Search block documents themselves instead of pool + embedded txs.
    #[serde(default)]
    pub target_is_block: bool,
}

/// Body of `GET /get/byjson`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JsonQueryOptions {
    pub key: String,
    pub value: Value,
    /// Only "strict" (equality) is implemented.
    #[serde(rename = "matcherType", default = "default_matcher_type")]
    pub matcher_type: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub sort_order: SortOrder,
}

fn default_matcher_type() -> String {
    "strict".to_string()
}

/// Body of `POST /post/byjson`, parsed leniently so that key errors surface
/// from the ledger with a precise position instead of a transport 400.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PostJsonOptions {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "prev_id", default)]
    pub prev_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(rename = "compatDateTime", default)]
    pub compat_datetime: bool,
    #[serde(default)]
    pub tenant: Option<String>,
}

impl PostJsonOptions {
    /// Top-level keys a post body may carry.
    pub const ALLOWED_KEYS: [&'static str; 5] =
        ["type", "prev_id", "data", "compatDateTime", "tenant"];
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct HistoryOptions {
    #[serde(default)]
    pub tenant: Option<String>,
}

/// Error body returned by both REST surfaces on 503.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApiErrorResponse {
    pub api: String,
    pub component: String,
    pub function: String,
    pub position: String,
    pub detail: String,
}

impl ApiErrorResponse {
    pub fn from_error(api: &str, err: &ModuleError) -> Self {
        Self {
            api: api.to_string(),
            component: err.component.clone(),
            function: err.function.clone(),
            position: err.position.clone(),
            detail: format!("{}: {}", err.kind, err.detail),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoginRequest {
    pub user: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LoginResponse {
    pub token: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostTxResponse {
    pub id: ObjectId,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TotalNumberResponse {
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_are_a_schema_error() {
        let res: Result<PoolQueryOptions, _> =
            serde_json::from_value(json!({"tenant": "t1", "bogus": true}));
        assert!(res.is_err());
    }

    #[test]
    fn test_json_query_defaults_to_strict() {
        let q: JsonQueryOptions =
            serde_json::from_value(json!({"key": "desc", "value": "test"})).unwrap();
        assert_eq!(q.matcher_type, "strict");
    }

    #[test]
    fn test_post_options_is_lenient_about_missing_type() {
        let p: PostJsonOptions = serde_json::from_value(json!({"data": {"a": 1}})).unwrap();
        assert!(p.kind.is_none());
        assert!(p.data.is_some());
    }

    #[test]
    fn test_sort_order_numeric_compat() {
        assert_eq!(SortOrder::from_i8(-1), SortOrder::IdDesc);
        assert_eq!(SortOrder::from_i8(1), SortOrder::IdAsc);
    }
}
