use super::{LedgerStore, SeriesStore};
use crate::config::Config;
use crate::error::LookupError;
use crate::ledger::{LedgerEntry, LedgerRow, LedgerSummary, ReplaceOutcome};
use crate::observation::{is_valid_sensor_id, ObservationRow, Variable};
use anyhow::Result;
use chrono::NaiveDateTime;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;

const LOCK_NAMESPACE: &str = "anomaly_ledger";
// Five binds per row, well under the protocol's 65535 parameter cap.
const INSERT_CHUNK_ROWS: usize = 1_000;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

fn advisory_lock_key(namespace: &str, value: &str) -> i64 {
    fn fnv1a_64(input: &str) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in input.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }

    let combined = format!("{namespace}:{value}");
    fnv1a_64(&combined) as i64
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `LIKE` pattern matching every name that starts with `prefix` literally.
fn like_prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Text-tolerant numeric read: values that are not numbers come back NULL so
/// the row is dropped during windowing instead of failing the whole table.
fn numeric_column(column: &str) -> String {
    let quoted = quote_ident(column);
    format!(
        r#"CASE WHEN {quoted}::text ~ '^\s*[-+]?([0-9]+\.?[0-9]*|\.[0-9]+)([eE][-+]?[0-9]+)?\s*$'
            THEN {quoted}::text::double precision END AS {quoted}"#
    )
}

/// `soil_date, light_date, air_date`, in `Variable::ALL` order.
fn ledger_date_columns() -> String {
    Variable::ALL
        .iter()
        .map(|variable| variable.ledger_column())
        .collect::<Vec<_>>()
        .join(", ")
}

fn greatest_anomaly_expr() -> String {
    format!("GREATEST({})", ledger_date_columns())
}

#[derive(Debug, sqlx::FromRow)]
struct SummaryRecord {
    grow_table: String,
    row_count: i64,
    last_analysed: Option<NaiveDateTime>,
    latest_anomaly: Option<NaiveDateTime>,
    days_since_anomaly: Option<i32>,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRecord {
    soil_date: Option<NaiveDateTime>,
    light_date: Option<NaiveDateTime>,
    air_date: Option<NaiveDateTime>,
    last_analysed: Option<NaiveDateTime>,
    days_since_anomaly: Option<i32>,
}

/// Observation tables and the anomaly ledger in one Postgres database.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    table_prefix: String,
    ledger_table: String,
}

impl PgStore {
    pub fn new(pool: PgPool, table_prefix: &str, ledger_table: &str) -> Self {
        Self {
            pool,
            table_prefix: table_prefix.to_string(),
            ledger_table: ledger_table.to_string(),
        }
    }

    pub fn from_config(pool: PgPool, config: &Config) -> Self {
        Self::new(pool, &config.table_prefix, &config.ledger_table)
    }

    /// Ledger key for a sensor, which is also its observation table name.
    pub fn table_name(&self, sensor_id: &str) -> String {
        format!("{}{}", self.table_prefix, sensor_id)
    }

    fn sensor_id_for<'a>(&self, table: &'a str) -> Option<&'a str> {
        table
            .strip_prefix(self.table_prefix.as_str())
            .filter(|id| is_valid_sensor_id(id))
    }

    fn ledger(&self) -> String {
        quote_ident(&self.ledger_table)
    }

    async fn lock_sensor(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        table: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_key(LOCK_NAMESPACE, table))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

impl SeriesStore for PgStore {
    async fn list_sensors(&self) -> Result<Vec<String>, sqlx::Error> {
        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_name::text LIKE $1 ESCAPE '\'
            ORDER BY table_name
            "#,
        )
        .bind(like_prefix_pattern(&self.table_prefix))
        .fetch_all(&self.pool)
        .await?;

        Ok(tables
            .iter()
            .filter_map(|table| {
                let id = self.sensor_id_for(table);
                if id.is_none() {
                    tracing::debug!(table = %table, "ignoring table with unusable sensor id");
                }
                id.map(str::to_string)
            })
            .collect())
    }

    async fn observations(&self, sensor_id: &str) -> Result<Vec<ObservationRow>, LookupError> {
        let table = self.table_name(sensor_id);
        let scored: Vec<String> = Variable::ALL
            .iter()
            .map(|variable| numeric_column(variable.observation_column()))
            .collect();
        let sql = format!(
            "SELECT datetime::timestamp AS datetime, {}, {} FROM {}",
            scored.join(", "),
            numeric_column("battery_level"),
            quote_ident(&table),
        );
        sqlx::query_as::<_, ObservationRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| LookupError::classify(&table, err))
    }

    async fn latest_observation_timestamp(
        &self,
        sensor_id: &str,
    ) -> Result<Option<NaiveDateTime>, LookupError> {
        let table = self.table_name(sensor_id);
        let sql = format!(
            "SELECT MAX(datetime)::timestamp FROM {}",
            quote_ident(&table)
        );
        sqlx::query_scalar::<_, Option<NaiveDateTime>>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| LookupError::classify(&table, err))
    }
}

impl LedgerStore for PgStore {
    async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        let ledger = self.ledger();
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ledger} (
                grow_table varchar(64) not null,
                soil_date timestamp null,
                light_date timestamp null,
                air_date timestamp null,
                last_analysed timestamp not null,
                days_since_anomaly integer null
            )
            "#
        ))
        .execute(&self.pool)
        .await?;
        // Older ledgers were created before staleness was tracked.
        sqlx::query(&format!(
            "ALTER TABLE {ledger} ADD COLUMN IF NOT EXISTS days_since_anomaly integer null"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {ledger} (grow_table)",
            quote_ident(&format!("{}_grow_table_idx", self.ledger_table))
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ledger_summaries(&self) -> Result<Vec<LedgerSummary>, sqlx::Error> {
        let records: Vec<SummaryRecord> = sqlx::query_as(&format!(
            r#"
            SELECT grow_table::text AS grow_table,
                   COUNT(*)::bigint AS row_count,
                   MAX(last_analysed) AS last_analysed,
                   MAX({greatest}) AS latest_anomaly,
                   MIN(days_since_anomaly)::integer AS days_since_anomaly
            FROM {ledger}
            GROUP BY grow_table
            ORDER BY grow_table
            "#,
            greatest = greatest_anomaly_expr(),
            ledger = self.ledger()
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let Some(sensor_id) = self.sensor_id_for(&record.grow_table) else {
                    tracing::warn!(
                        grow_table = %record.grow_table,
                        "ledger rows for a table outside the sensor prefix"
                    );
                    return None;
                };
                Some(LedgerSummary {
                    sensor_id: sensor_id.to_string(),
                    row_count: record.row_count,
                    last_analysed: record.last_analysed,
                    latest_anomaly: record.latest_anomaly,
                    days_since_anomaly: record.days_since_anomaly,
                })
            })
            .collect())
    }

    async fn entries_for(&self, sensor_id: &str) -> Result<Vec<LedgerRow>, sqlx::Error> {
        let records: Vec<LedgerRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {dates}, last_analysed, days_since_anomaly
            FROM {ledger}
            WHERE grow_table = $1
            ORDER BY {greatest}
            "#,
            dates = ledger_date_columns(),
            greatest = greatest_anomaly_expr(),
            ledger = self.ledger()
        ))
        .bind(self.table_name(sensor_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records
            .into_iter()
            .map(|record| LedgerRow {
                sensor_id: sensor_id.to_string(),
                soil_date: record.soil_date,
                light_date: record.light_date,
                air_date: record.air_date,
                last_analysed: record.last_analysed,
                days_since_anomaly: record.days_since_anomaly,
            })
            .collect())
    }

    async fn replace_entries(
        &self,
        sensor_id: &str,
        entries: &[LedgerEntry],
    ) -> Result<ReplaceOutcome, sqlx::Error> {
        let table = self.table_name(sensor_id);
        let ledger = self.ledger();

        let mut tx = self.pool.begin().await?;
        self.lock_sensor(&mut tx, &table).await?;

        let deleted = sqlx::query(&format!("DELETE FROM {ledger} WHERE grow_table = $1"))
            .bind(&table)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let dates = ledger_date_columns();
        let mut inserted = 0;
        for chunk in entries.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {ledger} (grow_table, {dates}, last_analysed) "
            ));
            builder.push_values(chunk.iter(), |mut b, entry| {
                b.push_bind(table.clone());
                for variable in Variable::ALL {
                    b.push_bind((entry.variable == variable).then_some(entry.anomaly_at));
                }
                b.push_bind(entry.last_analysed);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(ReplaceOutcome { deleted, inserted })
    }

    async fn update_staleness(
        &self,
        sensor_id: &str,
        anomaly_watermark: NaiveDateTime,
        days: i32,
    ) -> Result<u64, sqlx::Error> {
        let table = self.table_name(sensor_id);
        let ledger = self.ledger();
        let greatest = greatest_anomaly_expr();

        let mut tx = self.pool.begin().await?;
        self.lock_sensor(&mut tx, &table).await?;

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {ledger}
            SET days_since_anomaly = $2
            WHERE grow_table = $1
              AND (
                SELECT MAX({greatest})
                FROM {ledger}
                WHERE grow_table = $1
              ) = $3
            "#
        ))
        .bind(&table)
        .bind(days)
        .bind(anomaly_watermark)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(updated)
    }
}
