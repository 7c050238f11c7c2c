use crate::conditions::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

/// Sync interval used when the hub value cannot be parsed
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Mysql,
}

/// SecretKeyRef points to one key of a Secret in the hub namespace
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the secret
    pub key: String,
}

fn default_mysql_port() -> u16 {
    3306
}

/// MySQL connection settings
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MySqlSource {
    /// Server host name
    pub host: String,
    /// Server port, 3306 by default
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    /// User name
    pub username: String,
    /// Secret holding the password
    pub password_ref: Option<SecretKeyRef>,
    /// Database name
    pub database: String,
    /// Table holding one row per node
    pub table: String,
}

fn default_sync_interval() -> String {
    "30s".to_string()
}

/// External data source binding
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    /// Kind of data source
    #[serde(rename = "type", default)]
    pub source_type: SourceType,
    /// How often the rows are read (`30s`, `5m`, `1h`)
    #[serde(default = "default_sync_interval")]
    #[schemars(regex(pattern = r"^[0-9]+(s|m|h)$"))]
    pub sync_interval: String,
    /// MySQL settings, required when type is mysql
    pub mysql: Option<MySqlSource>,
}

/// Columns mapped onto the well known template variables
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueMappings {
    /// Column holding the unique id of the row
    pub uid: String,
    /// Column holding the host or url of the row
    pub host_or_url: Option<String>,
    /// Column deciding whether a row is active
    pub activate: String,
}

/// LynqHub binds an external table to the forms that consume its rows
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "LynqHub",
    status = "LynqHubStatus",
    shortname = "lh",
    group = "operator.lynq.sh",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource binding an external data source to lynq forms",
    printcolumn = r#"
    {"name":"Source",  "type":"string",  "description":"Source type", "jsonPath":".spec.source.type"},
    {"name":"Forms",   "type":"integer", "description":"Referencing forms", "jsonPath":".status.referencingForms"},
    {"name":"Desired", "type":"integer", "description":"Desired nodes", "jsonPath":".status.desired"},
    {"name":"Ready",   "type":"integer", "description":"Ready nodes", "jsonPath":".status.ready"},
    {"name":"Failed",  "type":"integer", "description":"Failed nodes", "jsonPath":".status.failed"},
    {"name":"Age",     "type":"date",    "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LynqHubSpec {
    /// Data source
    pub source: DataSourceSpec,
    /// Mapping of the required variables
    pub value_mappings: ValueMappings,
    /// Additional variables: alias -> column
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_value_mappings: BTreeMap<String, String>,
}

/// The status object of `LynqHub`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LynqHubStatus {
    /// Generation of the spec last processed
    #[serde(default)]
    pub observed_generation: i64,
    /// Number of forms using this hub
    #[serde(default)]
    pub referencing_forms: i32,
    /// Number of nodes that should exist (forms × active rows)
    #[serde(default)]
    pub desired: i32,
    /// Number of ready nodes
    #[serde(default)]
    pub ready: i32,
    /// Number of nodes that are not ready
    #[serde(default)]
    pub failed: i32,
    /// Hub conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Parse `30s`, `5m`, `1h`
pub fn parse_interval(value: &str) -> Option<Duration> {
    let value = value.trim();
    let unit = value.chars().last()?;
    let amount: u64 = value[..value.len() - unit.len_utf8()].parse().ok()?;
    match unit {
        's' => Some(Duration::from_secs(amount)),
        'm' => Some(Duration::from_secs(amount * 60)),
        'h' => Some(Duration::from_secs(amount * 3600)),
        _ => None,
    }
}

impl LynqHub {
    /// Requeue period, 30s when the configured value does not parse or is zero
    pub fn sync_interval(&self) -> Duration {
        match parse_interval(&self.spec.source.sync_interval) {
            Some(d) if !d.is_zero() => d,
            _ => {
                tracing::warn!(
                    "Invalid syncInterval {:?}, using {:?}",
                    self.spec.source.sync_interval,
                    DEFAULT_SYNC_INTERVAL
                );
                DEFAULT_SYNC_INTERVAL
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub(interval: &str) -> LynqHub {
        LynqHub::new(
            "customers",
            serde_json::from_value(json!({
                "source": {"type": "mysql", "syncInterval": interval, "mysql": {
                    "host": "db", "username": "lynq", "database": "crm", "table": "tenants"
                }},
                "valueMappings": {"uid": "id", "hostOrUrl": "url", "activate": "active"}
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_parse_interval_units() {
        assert_eq!(parse_interval("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_interval("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_interval("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_interval("10d"), None);
        assert_eq!(parse_interval("m"), None);
        assert_eq!(parse_interval(""), None);
    }

    #[test]
    fn test_sync_interval_falls_back_to_default() {
        assert_eq!(hub("1m").sync_interval(), Duration::from_secs(60));
        assert_eq!(hub("soon").sync_interval(), DEFAULT_SYNC_INTERVAL);
        assert_eq!(hub("0s").sync_interval(), DEFAULT_SYNC_INTERVAL);
    }

    #[test]
    fn test_mysql_port_defaults() {
        let h = hub("30s");
        assert_eq!(h.spec.source.mysql.unwrap().port, 3306);
    }
}
