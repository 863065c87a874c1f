//! Credential sets and their validated, durable store

use chrono::Utc;
use persistence::{CredentialBackend, CredentialRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::registry::{is_primary_field, ExchangeRegistry, API_KEY_FIELD, SECRET_KEY_FIELD};

/// A named set of secrets for one exchange
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    pub id: String,
    pub name: String,
    pub exchange_id: String,
    pub api_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub additional_fields: BTreeMap<String, String>,
}

impl CredentialSet {
    pub fn additional_field(&self, name: &str) -> Option<&str> {
        self.additional_fields.get(name).map(String::as_str)
    }

    /// View that is safe to log or hand to a UI
    pub fn summary(&self) -> CredentialSummary {
        CredentialSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            exchange_id: self.exchange_id.clone(),
            api_key_hint: mask(&self.api_key),
            additional_fields: self.additional_fields.keys().cloned().collect(),
        }
    }
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("exchange_id", &self.exchange_id)
            .field("api_key", &mask(&self.api_key))
            .field("secret_key", &"****")
            .field("additional_fields", &self.additional_fields.keys())
            .finish()
    }
}

impl From<CredentialRecord> for CredentialSet {
    fn from(record: CredentialRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            exchange_id: record.exchange_id,
            api_key: record.api_key,
            secret_key: record.secret_key,
            additional_fields: record.additional_fields.unwrap_or_default(),
        }
    }
}

impl From<&CredentialSet> for CredentialRecord {
    fn from(set: &CredentialSet) -> Self {
        Self {
            id: set.id.clone(),
            name: set.name.clone(),
            exchange_id: set.exchange_id.clone(),
            api_key: set.api_key.clone(),
            secret_key: set.secret_key.clone(),
            additional_fields: (!set.additional_fields.is_empty())
                .then(|| set.additional_fields.clone()),
        }
    }
}

/// Redacted credential set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub exchange_id: String,
    pub api_key_hint: String,
    pub additional_fields: Vec<String>,
}

/// `abcd1234wxyz` -> `abcd…wxyz`; short keys are fully masked
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len().max(4));
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// Unvalidated input for [`CredentialStore::save`].
///
/// With `id` set, the save replaces that record wholesale.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub exchange_id: String,
    pub api_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub additional_fields: BTreeMap<String, String>,
}

impl CredentialDraft {
    pub fn new(name: &str, exchange_id: &str, api_key: &str, secret_key: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            exchange_id: exchange_id.to_string(),
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
            additional_fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.additional_fields
            .insert(name.to_string(), value.to_string());
        self
    }

    fn value_of(&self, field: &str) -> &str {
        match field {
            API_KEY_FIELD => &self.api_key,
            SECRET_KEY_FIELD => &self.secret_key,
            other => self
                .additional_fields
                .get(other)
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

/// Validated store of credential sets over an injected backend.
///
/// Mutations are serialized; each one reads the whole collection, changes it
/// and writes it back in full.
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
    registry: Arc<ExchangeRegistry>,
    /// Guards read-modify-write and holds the last issued id
    write_lock: Mutex<i64>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn CredentialBackend>, registry: Arc<ExchangeRegistry>) -> Self {
        Self {
            backend,
            registry,
            write_lock: Mutex::new(0),
        }
    }

    pub fn registry(&self) -> &ExchangeRegistry {
        &self.registry
    }

    /// Validate a draft against its exchange schema; values come back trimmed
    pub fn validate(&self, draft: &CredentialDraft) -> EngineResult<CredentialSet> {
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("name", "is required"));
        }

        let descriptor = self.registry.lookup(draft.exchange_id.trim())?;

        for field in draft.additional_fields.keys() {
            if is_primary_field(field) || descriptor.field_spec(field).is_none() {
                return Err(EngineError::validation(
                    field,
                    format!("is not used by {}", descriptor.name),
                ));
            }
        }

        for spec in &descriptor.required_fields {
            spec.check(draft.value_of(&spec.name))?;
        }

        Ok(CredentialSet {
            id: draft.id.clone().unwrap_or_default(),
            name: name.to_string(),
            exchange_id: descriptor.id.clone(),
            api_key: draft.api_key.trim().to_string(),
            secret_key: draft.secret_key.trim().to_string(),
            additional_fields: draft
                .additional_fields
                .iter()
                .map(|(k, v)| (k.clone(), v.trim().to_string()))
                .collect(),
        })
    }

    /// Validate and persist a draft. Nothing is written when validation fails.
    pub async fn save(&self, draft: CredentialDraft) -> EngineResult<CredentialSet> {
        let mut set = self.validate(&draft)?;

        let mut last_id = self.write_lock.lock().await;
        let mut records = self.backend.load_all().await?;

        if set.id.is_empty() {
            set.id = next_id(&mut *last_id, &records);
        }

        let record = CredentialRecord::from(&set);
        match records.iter_mut().find(|r| r.id == set.id) {
            Some(existing) => {
                *existing = record;
                info!(id = %set.id, exchange = %set.exchange_id, "Credential set replaced");
            }
            None => {
                records.push(record);
                info!(id = %set.id, exchange = %set.exchange_id, "Credential set added");
            }
        }

        self.backend.store_all(&records).await?;
        Ok(set)
    }

    /// All stored sets; the order carries no meaning
    pub async fn list(&self) -> EngineResult<Vec<CredentialSet>> {
        let records = self.backend.load_all().await?;
        Ok(records.into_iter().map(CredentialSet::from).collect())
    }

    pub async fn get(&self, id: &str) -> EngineResult<CredentialSet> {
        self.backend
            .load_all()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .map(CredentialSet::from)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Remove a set; unknown ids are a no-op
    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.backend.load_all().await?;
        let before = records.len();
        records.retain(|r| r.id != id);

        if records.len() == before {
            debug!(id, "Delete of unknown credential set ignored");
            return Ok(());
        }

        self.backend.store_all(&records).await?;
        info!(id, "Credential set deleted");
        Ok(())
    }
}

/// Millisecond timestamp, bumped past the previous id and any stored one
fn next_id(last: &mut i64, records: &[CredentialRecord]) -> String {
    let mut candidate = Utc::now().timestamp_millis().max(*last + 1);
    while records.iter().any(|r| r.id == candidate.to_string()) {
        candidate += 1;
    }
    *last = candidate;
    candidate.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{digits_only, ExchangeDescriptor, FieldSpec};
    use persistence::MemoryBackend;

    fn acme_registry() -> Arc<ExchangeRegistry> {
        Arc::new(ExchangeRegistry::new([ExchangeDescriptor::new(
            "acme",
            "Acme",
            "http://acme.test/api",
            "ws://acme.test/ws",
        )
        .field(FieldSpec::new("accountGroup").validate_with(digits_only))]))
    }

    fn store_with(backend: Arc<MemoryBackend>) -> CredentialStore {
        CredentialStore::new(backend, acme_registry())
    }

    fn acme_draft(group: &str) -> CredentialDraft {
        CredentialDraft::new("acme main", "acme", "k", "s").with_field("accountGroup", group)
    }

    #[tokio::test]
    async fn test_invalid_account_group_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone());

        let err = store.save(acme_draft("abc")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "accountGroup"));
        assert_eq!(backend.write_count(), 0);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_valid_account_group_is_saved_and_retrievable() {
        let store = store_with(Arc::new(MemoryBackend::new()));

        let saved = store.save(acme_draft("7")).await.unwrap();
        assert!(!saved.id.is_empty());

        let fetched = store.get(&saved.id).await.unwrap();
        assert_eq!(fetched, saved);
        assert_eq!(fetched.name, "acme main");
        assert_eq!(fetched.exchange_id, "acme");
        assert_eq!(fetched.api_key, "k");
        assert_eq!(fetched.secret_key, "s");
        assert_eq!(fetched.additional_field("accountGroup"), Some("7"));
    }

    #[tokio::test]
    async fn test_missing_required_field_names_it() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone());

        let cases = [
            (CredentialDraft::new("n", "acme", "", "s").with_field("accountGroup", "1"), "apiKey"),
            (CredentialDraft::new("n", "acme", "k", "  ").with_field("accountGroup", "1"), "secretKey"),
            (CredentialDraft::new("n", "acme", "k", "s"), "accountGroup"),
            (CredentialDraft::new(" ", "acme", "k", "s").with_field("accountGroup", "1"), "name"),
        ];
        for (draft, missing) in cases {
            match store.save(draft).await {
                Err(EngineError::Validation { field, .. }) => assert_eq!(field, missing),
                other => panic!("expected validation error for {missing}, got {other:?}"),
            }
        }
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_additional_field_is_rejected() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let draft = acme_draft("1").with_field("passphrase", "x");
        let err = store.save(draft).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { ref field, .. } if field == "passphrase"));
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_unsupported() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let err = store
            .save(CredentialDraft::new("n", "ftx", "k", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedExchange(_)));
    }

    #[tokio::test]
    async fn test_values_are_trimmed() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let saved = store
            .save(CredentialDraft::new("  main ", "acme", " k ", "s\n").with_field("accountGroup", " 3 "))
            .await
            .unwrap();
        assert_eq!(saved.name, "main");
        assert_eq!(saved.api_key, "k");
        assert_eq!(saved.secret_key, "s");
        assert_eq!(saved.additional_field("accountGroup"), Some("3"));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let a = store.save(acme_draft("1")).await.unwrap();
        let b = store.save(acme_draft("2")).await.unwrap();
        let c = store.save(acme_draft("3")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_eq!(store.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_save_with_existing_id_replaces() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let first = store.save(acme_draft("1")).await.unwrap();

        let mut replacement = acme_draft("9");
        replacement.id = Some(first.id.clone());
        replacement.name = "renamed".into();
        store.save(replacement).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "renamed");
        assert_eq!(all[0].additional_field("accountGroup"), Some("9"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone());
        let saved = store.save(acme_draft("1")).await.unwrap();

        store.delete(&saved.id).await.unwrap();
        assert!(matches!(
            store.get(&saved.id).await,
            Err(EngineError::NotFound(id)) if id == saved.id
        ));

        let writes = backend.write_count();
        store.delete(&saved.id).await.unwrap();
        store.delete("never-existed").await.unwrap();
        assert_eq!(backend.write_count(), writes);
    }

    #[tokio::test]
    async fn test_concurrent_saves_do_not_lose_records() {
        let store = Arc::new(store_with(Arc::new(MemoryBackend::new())));
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save(acme_draft(&i.to_string())).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.list().await.unwrap().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_saves_and_deletes_keep_collection_consistent() {
        let store = Arc::new(store_with(Arc::new(MemoryBackend::new())));
        let mut existing = Vec::new();
        for i in 0..20 {
            existing.push(store.save(acme_draft(&i.to_string())).await.unwrap().id);
        }
        let (doomed, kept) = existing.split_at(10);

        let mut deletes = Vec::new();
        for id in doomed.to_vec() {
            let store = store.clone();
            deletes.push(tokio::spawn(async move { store.delete(&id).await.unwrap() }));
        }
        let mut saves = Vec::new();
        for i in 20..30 {
            let store = store.clone();
            saves.push(tokio::spawn(async move {
                store.save(acme_draft(&i.to_string())).await.unwrap().id
            }));
        }
        for handle in deletes {
            handle.await.unwrap();
        }
        let mut added = Vec::new();
        for handle in saves {
            added.push(handle.await.unwrap());
        }

        let mut ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id).collect();
        let mut expected: Vec<String> = kept.iter().cloned().chain(added).collect();
        ids.sort();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let set = CredentialSet {
            id: "1".into(),
            name: "main".into(),
            exchange_id: "acme".into(),
            api_key: "AKIAVERYSECRETKEY1234".into(),
            secret_key: "topsecret".into(),
            additional_fields: BTreeMap::new(),
        };
        let printed = format!("{set:?}");
        assert!(!printed.contains("topsecret"));
        assert!(!printed.contains("VERYSECRET"));
        assert_eq!(set.summary().api_key_hint, "AKIA…1234");
    }

    #[test]
    fn test_record_conversion_drops_empty_extra_map() {
        let set = CredentialSet {
            id: "1".into(),
            name: "main".into(),
            exchange_id: "acme".into(),
            api_key: "k".into(),
            secret_key: "s".into(),
            additional_fields: BTreeMap::new(),
        };
        let record = CredentialRecord::from(&set);
        assert!(record.additional_fields.is_none());
        assert_eq!(CredentialSet::from(record), set);
    }
}
