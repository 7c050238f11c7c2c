use crate::{
    Error, LynqHub, Result,
    hub::{SourceType, ValueMappings},
    k8sgeneric::{ObjectKey, ObjectStore},
    mysql::MySqlDataSource,
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use kube::ResourceExt;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// One row of the external table, already mapped onto the template variables
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Row {
    pub uid: String,
    pub host_or_url: String,
    pub activate: String,
    pub extra: BTreeMap<String, String>,
}

impl Row {
    pub fn is_active(&self) -> bool {
        is_truthy(&self.activate)
    }
}

/// What to read and how to map it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryConfig {
    pub table: String,
    pub value_mappings: ValueMappings,
    pub extra_mappings: BTreeMap<String, String>,
}

impl QueryConfig {
    pub fn from_hub(hub: &LynqHub) -> Result<QueryConfig> {
        let table = match hub.spec.source.source_type {
            SourceType::Mysql => hub
                .spec
                .source
                .mysql
                .as_ref()
                .map(|m| m.table.clone())
                .ok_or_else(|| Error::MissingSourceConfig("spec.source.mysql".to_string()))?,
        };
        Ok(QueryConfig {
            table,
            value_mappings: hub.spec.value_mappings.clone(),
            extra_mappings: hub.spec.extra_value_mappings.clone(),
        })
    }
}

/// Connection settings handed to a driver
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"****")
            .field("database", &self.database)
            .finish()
    }
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn query_rows(&self, config: &QueryConfig) -> Result<Vec<Row>>;

    async fn close(&self) {}
}

/// Opens the data source of a hub
#[async_trait]
pub trait DataSourceFactory: Send + Sync {
    async fn open(&self, hub: &LynqHub, store: &dyn ObjectStore) -> Result<Arc<dyn DataSource>>;
}

/// `true`, `1`, `yes` and `on`, whatever the case
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Rows that should get nodes: active and with a uid
pub fn active_rows(rows: Vec<Row>) -> Vec<Row> {
    rows.into_iter()
        .filter(|r| {
            if r.uid.is_empty() {
                tracing::debug!("Skipping a row without uid");
                return false;
            }
            r.is_active()
        })
        .collect()
}

/// Password from the Secret referenced by the hub, empty when there is no reference
pub async fn resolve_password(hub: &LynqHub, store: &dyn ObjectStore) -> Result<String> {
    let Some(reference) = hub.spec.source.mysql.as_ref().and_then(|m| m.password_ref.as_ref()) else {
        return Ok(String::new());
    };
    let ns = hub.namespace().ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let key = ObjectKey::new("v1", "Secret", Some(&ns), &reference.name);
    let secret = store
        .get(&key)
        .await?
        .ok_or_else(|| Error::MissingSourceConfig(format!("secret {}/{} not found", ns, reference.name)))?;
    let encoded = secret
        .pointer(&format!("/data/{}", reference.key.replace('~', "~0").replace('/', "~1")))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            Error::MissingSourceConfig(format!("key {} missing from secret {}", reference.key, reference.name))
        })?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Other(format!("secret {} is not valid base64: {e}", reference.name)))?;
    String::from_utf8(bytes).map_err(|e| Error::Other(format!("secret {} is not utf-8: {e}", reference.name)))
}

/// Opens real database connections
#[derive(Clone, Debug, Default)]
pub struct SqlDataSourceFactory;

#[async_trait]
impl DataSourceFactory for SqlDataSourceFactory {
    async fn open(&self, hub: &LynqHub, store: &dyn ObjectStore) -> Result<Arc<dyn DataSource>> {
        match hub.spec.source.source_type {
            SourceType::Mysql => {
                let mysql = hub
                    .spec
                    .source
                    .mysql
                    .as_ref()
                    .ok_or_else(|| Error::MissingSourceConfig("spec.source.mysql".to_string()))?;
                let config = ConnectionConfig {
                    host: mysql.host.clone(),
                    port: mysql.port,
                    username: mysql.username.clone(),
                    password: resolve_password(hub, store).await?,
                    database: mysql.database.clone(),
                };
                Ok(Arc::new(MySqlDataSource::connect(&config).await?))
            }
        }
    }
}
