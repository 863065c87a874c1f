//! Credential repository: full-collection reads and atomic full rewrites

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;

/// One stored credential set, in the layout shared by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub name: String,
    pub exchange_id: String,
    pub api_key: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_fields: Option<BTreeMap<String, String>>,
}

/// Raw row; `additional_fields` is kept as a JSON object string
#[derive(Debug, FromRow)]
struct CredentialRow {
    id: String,
    name: String,
    exchange_id: String,
    api_key: String,
    secret_key: String,
    additional_fields: Option<String>,
}

impl TryFrom<CredentialRow> for CredentialRecord {
    type Error = serde_json::Error;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let additional_fields = row
            .additional_fields
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Self {
            id: row.id,
            name: row.name,
            exchange_id: row.exchange_id,
            api_key: row.api_key,
            secret_key: row.secret_key,
            additional_fields,
        })
    }
}

/// Repository for the credential collection
pub struct CredentialRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> CredentialRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Load the whole collection in write order
    pub async fn load_all(&self) -> DbResult<Vec<CredentialRecord>> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            r#"SELECT id, name, exchange_id, api_key, secret_key, additional_fields
               FROM credential_sets ORDER BY position ASC"#,
        )
        .fetch_all(self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(CredentialRecord::try_from(row)?);
        }
        Ok(records)
    }

    /// Replace the whole collection in one transaction.
    /// Readers see either the old or the new collection, never a mix.
    pub async fn replace_all(&self, records: &[CredentialRecord]) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM credential_sets")
            .execute(&mut *tx)
            .await?;

        for (position, record) in records.iter().enumerate() {
            let additional = record
                .additional_fields
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                r#"INSERT INTO credential_sets
                    (id, position, name, exchange_id, api_key, secret_key, additional_fields)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
            )
            .bind(&record.id)
            .bind(position as i64)
            .bind(&record.name)
            .bind(&record.exchange_id)
            .bind(&record.api_key)
            .bind(&record.secret_key)
            .bind(additional)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
