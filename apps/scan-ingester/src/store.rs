use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::scan::Scan;

#[async_trait]
pub trait UpsertStore: Send + Sync {
    /// Persist the batch atomically: every row lands or none do.
    async fn upsert_many(&self, scans: &[Scan]) -> Result<()>;
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UpsertStore for PgStore {
    async fn upsert_many(&self, scans: &[Scan]) -> Result<()> {
        if scans.is_empty() {
            return Ok(());
        }

        let mut ips = Vec::with_capacity(scans.len());
        let mut ports = Vec::with_capacity(scans.len());
        let mut services = Vec::with_capacity(scans.len());
        let mut responses = Vec::with_capacity(scans.len());
        let mut seen = Vec::with_capacity(scans.len());
        for scan in scans {
            ips.push(IpNetwork::from(scan.ip));
            ports.push(i32::from(scan.port));
            services.push(scan.service.clone());
            responses.push(scan.response.clone());
            seen.push(scan.last_seen());
        }

        // The conflict guard is the canonical ordering enforcement; the
        // cache in front of it only saves round trips.
        sqlx::query(
            r#"
            INSERT INTO scan_results (ip, port, service, response, last_seen)
            SELECT * FROM
                UNNEST($1::inet[], $2::int[], $3::text[], $4::text[], $5::timestamp[])
            ON CONFLICT ON CONSTRAINT ip_port_service
            DO UPDATE SET
                response = EXCLUDED.response,
                last_seen = EXCLUDED.last_seen
            WHERE EXCLUDED.last_seen > scan_results.last_seen
            "#,
        )
        .bind(ips)
        .bind(ports)
        .bind(services)
        .bind(responses)
        .bind(seen)
        .execute(&self.pool)
        .await
        .context("batch upsert failed")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn sample(port: u16, timestamp: i64, response: &str) -> Scan {
        Scan {
            ip: "1.1.1.1".parse().unwrap(),
            port,
            service: "DNS".to_string(),
            timestamp,
            response: response.to_string(),
        }
    }

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_results (
                ip inet NOT NULL,
                port int NOT NULL,
                service text NOT NULL,
                response text NOT NULL,
                last_seen timestamp NOT NULL,
                CONSTRAINT ip_port_service UNIQUE (ip, port, service)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(pool)
    }

    #[tokio::test]
    async fn upsert_keeps_the_latest_observation_per_key() -> Result<()> {
        if env::var("INGESTER_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("INGESTER_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };

        let schema = format!("scan_ingester_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = PgStore::new(pool.clone());

        // an empty batch never touches the table
        store.upsert_many(&[]).await?;

        store
            .upsert_many(&[sample(53, 100, "first"), sample(443, 100, "tls")])
            .await?;
        store.upsert_many(&[sample(53, 200, "second")]).await?;
        // out-of-order redelivery must not regress the stored row
        store.upsert_many(&[sample(53, 140, "stale")]).await?;

        let (response, count): (String, i64) = sqlx::query_as(
            "SELECT response, (SELECT COUNT(*) FROM scan_results) FROM scan_results WHERE port = 53",
        )
        .fetch_one(&pool)
        .await?;
        assert_eq!(response, "second");
        assert_eq!(count, 2);

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;

        Ok(())
    }
}
