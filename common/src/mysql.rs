use crate::{
    Result,
    datasource::{ConnectionConfig, DataSource, QueryConfig, Row},
};
use async_trait::async_trait;
use sqlx::{
    Row as _,
    mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions},
};
use std::{collections::BTreeMap, time::Duration};
use tracing::*;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn quote(column: &str) -> String {
    format!("`{}`", column.replace('`', "``"))
}

/// Column as text, NULL kept as NULL
fn text(column: &str) -> String {
    format!("CAST({} AS CHAR)", quote(column))
}

/// SELECT statement for `config` and the extra aliases in column order
pub fn build_query(config: &QueryConfig) -> (String, Vec<String>) {
    let mappings = &config.value_mappings;
    let mut columns = vec![text(&mappings.uid)];
    if let Some(host) = mappings.host_or_url.as_ref().filter(|h| !h.is_empty()) {
        columns.push(text(host));
    }
    columns.push(text(&mappings.activate));
    // BTreeMap iteration keeps the aliases sorted
    let aliases: Vec<String> = config.extra_mappings.keys().cloned().collect();
    for alias in &aliases {
        columns.push(text(&config.extra_mappings[alias]));
    }
    let sql = format!("SELECT {} FROM {}", columns.join(", "), quote(&config.table));
    (sql, aliases)
}

/// MySQL backed DataSource
pub struct MySqlDataSource {
    pool: MySqlPool,
}

impl MySqlDataSource {
    #[instrument(skip(config), fields(host = %config.host, database = %config.database))]
    pub async fn connect(config: &ConnectionConfig) -> Result<MySqlDataSource> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(CONNECT_TIMEOUT)
            .max_lifetime(Duration::from_secs(300))
            .connect_with(options)
            .await?;
        debug!("MySQL connection pool ready");
        Ok(MySqlDataSource { pool })
    }
}

#[async_trait]
impl DataSource for MySqlDataSource {
    async fn query_rows(&self, config: &QueryConfig) -> Result<Vec<Row>> {
        let (sql, aliases) = build_query(config);
        let with_host = config.value_mappings.host_or_url.as_ref().is_some_and(|h| !h.is_empty());
        let records = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let mut idx = 0;
            let mut next = || -> Result<String> {
                let v: Option<String> = record.try_get(idx)?;
                idx += 1;
                Ok(v.unwrap_or_default())
            };
            let uid = next()?;
            let host_or_url = if with_host { next()? } else { String::new() };
            let activate = next()?;
            let mut extra = BTreeMap::new();
            for alias in &aliases {
                extra.insert(alias.clone(), next()?);
            }
            rows.push(Row {
                uid,
                host_or_url,
                activate,
                extra,
            });
        }
        debug!("Read {} rows from {}", rows.len(), config.table);
        Ok(rows)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ValueMappings;

    fn config(host: Option<&str>) -> QueryConfig {
        let mut extra = BTreeMap::new();
        extra.insert("region".to_string(), "region_col".to_string());
        extra.insert("plan".to_string(), "plan`col".to_string());
        QueryConfig {
            table: "tenants".into(),
            value_mappings: ValueMappings {
                uid: "id".into(),
                host_or_url: host.map(str::to_string),
                activate: "active".into(),
            },
            extra_mappings: extra,
        }
    }

    #[test]
    fn test_query_with_host_and_sorted_extras() {
        let (sql, aliases) = build_query(&config(Some("url")));
        assert_eq!(
            sql,
            "SELECT CAST(`id` AS CHAR), CAST(`url` AS CHAR), CAST(`active` AS CHAR), \
             CAST(`plan``col` AS CHAR), CAST(`region_col` AS CHAR) FROM `tenants`"
        );
        assert_eq!(aliases, vec!["plan", "region"]);
    }

    #[test]
    fn test_query_without_host() {
        let (sql, _) = build_query(&config(None));
        assert!(sql.starts_with("SELECT CAST(`id` AS CHAR), CAST(`active` AS CHAR)"));
    }
}
