//! Exchange catalog: static connection and credential schema per exchange
//!
//! Descriptors are built once at startup and are read-only afterwards; every
//! other component looks exchanges up here instead of branching on ids.

use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::adapter::AdapterKind;
use crate::error::{EngineError, EngineResult};

/// Name of the primary key field every exchange requires
pub const API_KEY_FIELD: &str = "apiKey";
/// Name of the primary secret field every exchange requires
pub const SECRET_KEY_FIELD: &str = "secretKey";

/// Predicate applied to a trimmed, non-empty field value
pub type FieldValidator = fn(&str) -> bool;

/// Accepts one or more ASCII digits
pub fn digits_only(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// One required credential field
#[derive(Debug, Clone, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(skip)]
    pub validator: Option<FieldValidator>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            link: None,
            validator: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn validate_with(mut self, validator: FieldValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Check a value against this field's rules
    pub fn check(&self, value: &str) -> EngineResult<()> {
        let value = value.trim();
        if value.is_empty() {
            return Err(EngineError::validation(&self.name, "is required"));
        }
        if let Some(validator) = self.validator {
            if !validator(value) {
                return Err(EngineError::validation(&self.name, "has an invalid format"));
            }
        }
        Ok(())
    }
}

/// Immutable catalog entry for one exchange
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub base_url: String,
    pub ws_url: String,
    pub features: Vec<String>,
    /// Ordered; always starts with the two primary fields
    pub required_fields: Vec<FieldSpec>,
    pub adapter: AdapterKind,
}

impl ExchangeDescriptor {
    /// Start a descriptor that requires only the primary key/secret pair
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
        ws_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            base_url: base_url.into(),
            ws_url: ws_url.into(),
            features: Vec::new(),
            required_fields: vec![FieldSpec::new(API_KEY_FIELD), FieldSpec::new(SECRET_KEY_FIELD)],
            adapter: AdapterKind::Generic,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn features(mut self, features: &[&str]) -> Self {
        self.features = features.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn adapter(mut self, adapter: AdapterKind) -> Self {
        self.adapter = adapter;
        self
    }

    /// Add a field, or replace the spec of an already declared one
    pub fn field(mut self, spec: FieldSpec) -> Self {
        match self.required_fields.iter_mut().find(|f| f.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.required_fields.push(spec),
        }
        self
    }

    pub fn with_endpoints(mut self, base_url: Option<String>, ws_url: Option<String>) -> Self {
        if let Some(base_url) = base_url {
            self.base_url = base_url;
        }
        if let Some(ws_url) = ws_url {
            self.ws_url = ws_url;
        }
        self
    }

    pub fn required_field_names(&self) -> impl Iterator<Item = &str> {
        self.required_fields.iter().map(|f| f.name.as_str())
    }

    /// Required fields other than the primary key/secret pair
    pub fn additional_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.required_fields
            .iter()
            .filter(|f| !is_primary_field(&f.name))
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.required_fields.iter().find(|f| f.name == name)
    }

    /// `base_url` joined with `path`, without doubling the slash
    pub fn rest_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

pub fn is_primary_field(name: &str) -> bool {
    name == API_KEY_FIELD || name == SECRET_KEY_FIELD
}

/// REST/stream endpoint replacement applied while building the catalog
#[derive(Debug, Clone, Default)]
pub struct EndpointOverride {
    pub exchange_id: String,
    pub base_url: Option<String>,
    pub ws_url: Option<String>,
}

/// Process-wide, read-only set of supported exchanges
#[derive(Debug, Clone)]
pub struct ExchangeRegistry {
    descriptors: Vec<Arc<ExchangeDescriptor>>,
}

impl ExchangeRegistry {
    /// Build a catalog; a later descriptor with a repeated id replaces the earlier one
    pub fn new(descriptors: impl IntoIterator<Item = ExchangeDescriptor>) -> Self {
        let mut list: Vec<Arc<ExchangeDescriptor>> = Vec::new();
        for descriptor in descriptors {
            match list.iter_mut().find(|d| d.id == descriptor.id) {
                Some(slot) => *slot = Arc::new(descriptor),
                None => list.push(Arc::new(descriptor)),
            }
        }
        debug!(count = list.len(), "Exchange registry built");
        Self { descriptors: list }
    }

    /// The exchanges supported out of the box
    pub fn builtin() -> Self {
        Self::new(builtin_descriptors())
    }

    /// Built-in catalog with endpoint overrides applied (unknown ids are ignored)
    pub fn builtin_with(overrides: &[EndpointOverride]) -> Self {
        Self::new(builtin_descriptors().into_iter().map(|d| {
            match overrides.iter().find(|o| o.exchange_id == d.id) {
                Some(o) => d.with_endpoints(o.base_url.clone(), o.ws_url.clone()),
                None => d,
            }
        }))
    }

    pub fn lookup(&self, exchange_id: &str) -> EngineResult<Arc<ExchangeDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.id == exchange_id)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedExchange(exchange_id.to_string()))
    }

    pub fn contains(&self, exchange_id: &str) -> bool {
        self.descriptors.iter().any(|d| d.id == exchange_id)
    }

    /// All descriptors in declaration order
    pub fn list(&self) -> &[Arc<ExchangeDescriptor>] {
        &self.descriptors
    }
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_descriptors() -> Vec<ExchangeDescriptor> {
    vec![
        ExchangeDescriptor::new(
            "binance",
            "Binance",
            "https://api.binance.com/api/v3",
            "wss://stream.binance.com:9443/ws",
        )
        .describe("Leading global cryptocurrency exchange")
        .features(&["spot", "futures", "margin"])
        .adapter(AdapterKind::Binance)
        .field(
            FieldSpec::new(API_KEY_FIELD)
                .describe("Create this key in your Binance account security settings")
                .link("https://www.binance.com/en/support/faq/how-to-create-api-keys-360002502072"),
        )
        .field(
            FieldSpec::new(SECRET_KEY_FIELD)
                .describe("Save this key when created, it cannot be viewed again"),
        ),
        ExchangeDescriptor::new(
            "ascendex",
            "AscendEX",
            "https://ascendex.com/api/pro/v1",
            "wss://ascendex.com/api/pro/v1/stream",
        )
        .describe("Professional digital asset trading platform")
        .features(&["spot", "futures"])
        .adapter(AdapterKind::Ascendex)
        .field(
            FieldSpec::new(API_KEY_FIELD)
                .describe("Generate API key from your AscendEX account settings"),
        )
        .field(
            FieldSpec::new(SECRET_KEY_FIELD).describe("Store this key safely, it cannot be recovered"),
        )
        .field(
            FieldSpec::new("accountGroup")
                .describe("Your account group number from AscendEX (e.g., 1, 2, 3)")
                .validate_with(digits_only),
        ),
        ExchangeDescriptor::new(
            "kucoin",
            "KuCoin",
            "https://api.kucoin.com/api/v1",
            "wss://ws-api.kucoin.com/endpoint",
        )
        .describe("Global cryptocurrency exchange")
        .features(&["spot", "futures", "margin"])
        .adapter(AdapterKind::Kucoin)
        .field(
            FieldSpec::new(API_KEY_FIELD)
                .describe("Create API key in KuCoin security settings")
                .link("https://support.kucoin.plus/hc/en-us/articles/360015051773"),
        )
        .field(FieldSpec::new(SECRET_KEY_FIELD).describe("Save this key immediately after creation"))
        .field(FieldSpec::new("passphrase").describe("Required for API authentication")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_order_and_fields() {
        let registry = ExchangeRegistry::builtin();
        let ids: Vec<_> = registry.list().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["binance", "ascendex", "kucoin"]);

        let kucoin = registry.lookup("kucoin").unwrap();
        assert_eq!(
            kucoin.required_field_names().collect::<Vec<_>>(),
            ["apiKey", "secretKey", "passphrase"]
        );
        assert_eq!(kucoin.adapter, AdapterKind::Kucoin);
    }

    #[test]
    fn test_lookup_unknown_exchange() {
        let err = ExchangeRegistry::builtin().lookup("mtgox").unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedExchange(id) if id == "mtgox"));
    }

    #[test]
    fn test_account_group_must_be_digits() {
        let ascendex = ExchangeRegistry::builtin().lookup("ascendex").unwrap();
        let spec = ascendex.field_spec("accountGroup").unwrap();
        assert!(spec.check("7").is_ok());
        assert!(matches!(
            spec.check("abc"),
            Err(EngineError::Validation { field, .. }) if field == "accountGroup"
        ));
        assert!(spec.check("   ").is_err());
    }

    #[test]
    fn test_additional_fields_exclude_primary_pair() {
        let ascendex = ExchangeRegistry::builtin().lookup("ascendex").unwrap();
        let extra: Vec<_> = ascendex.additional_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(extra, ["accountGroup"]);

        let binance = ExchangeRegistry::builtin().lookup("binance").unwrap();
        assert_eq!(binance.additional_fields().count(), 0);
    }

    #[test]
    fn test_endpoint_override() {
        let registry = ExchangeRegistry::builtin_with(&[EndpointOverride {
            exchange_id: "binance".into(),
            base_url: Some("http://127.0.0.1:9000/api/v3".into()),
            ws_url: None,
        }]);
        let binance = registry.lookup("binance").unwrap();
        assert_eq!(binance.base_url, "http://127.0.0.1:9000/api/v3");
        assert_eq!(binance.ws_url, "wss://stream.binance.com:9443/ws");
        assert_eq!(binance.rest_url("/ping"), "http://127.0.0.1:9000/api/v3/ping");
    }

    #[test]
    fn test_custom_descriptor_replaces_duplicate_id() {
        let registry = ExchangeRegistry::new([
            ExchangeDescriptor::new("acme", "Acme", "http://a", "ws://a"),
            ExchangeDescriptor::new("acme", "Acme v2", "http://b", "ws://b"),
        ]);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.lookup("acme").unwrap().name, "Acme v2");
    }

    #[test]
    fn test_digits_only() {
        assert!(digits_only("0123"));
        assert!(!digits_only(""));
        assert!(!digits_only("12a"));
        assert!(!digits_only("-1"));
    }
}
