//! Postgres-backed [`PartitionedStore`].
//!
//! All tables and shards live in the single `items` table created by the migrations
//! in `migrations/`; `table_name` carries the logical table plus shard suffix.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    types::Json,
    ConnectOptions, Pool, Postgres, QueryBuilder, Row,
};
use tokio::time::sleep;
use tracing::{info, warn};

use super::{
    BatchDeleteOutput, BatchGetOutput, BatchWriteOutput, Condition, Item, ItemKey,
    PartitionedStore, Put, PutOutcome, QueryPage, QueryRequest, SortKeyCondition,
    MAX_BATCH_ITEMS,
};
use crate::errors::{BlockchainError, Result};

pub const DB_MAX_CONNECTIONS: u32 = 50;
const MAX_RETRIES: u32 = 3;

#[derive(Debug)]
pub struct PgStore {
    pub pool: Pool<Postgres>,
}

impl PgStore {
    pub async fn new(db_conn_string: &str) -> Result<Arc<Self>> {
        let mut conn_options: PgConnectOptions = db_conn_string.parse().map_err(|e| {
            BlockchainError::configuration("db_conn_string", format!("Invalid connection string: {e}"))
        })?;
        conn_options = conn_options
            .log_slow_statements(tracing::log::LevelFilter::Debug, Duration::new(120, 0));

        let pool = PgPoolOptions::new()
            .max_connections(DB_MAX_CONNECTIONS)
            .connect_with(conn_options)
            .await?;

        Ok(Arc::new(Self { pool }))
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Run migrations");
        sqlx::migrate!().run(&self.pool).await.map_err(|e| {
            BlockchainError::store_unavailable(format!("Failed to run database migrations: {e}"))
        })
    }

    async fn get_chunk(&self, keys: &[ItemKey]) -> Result<HashMap<ItemKey, Item>> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT table_name, partition_key, sort_key, attributes FROM items \
             WHERE (table_name, partition_key, sort_key) IN ",
        );
        query_builder.push_tuples(keys, |mut b, key| {
            b.push_bind(&key.table)
                .push_bind(&key.partition_key)
                .push_bind(&key.sort_key);
        });

        let rows = query_builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_entry).collect()
    }

    async fn write_chunk(&self, puts: &[Put]) -> Result<()> {
        // A single INSERT cannot touch the same key twice, so later puts win.
        let mut latest: HashMap<&ItemKey, &Item> = HashMap::with_capacity(puts.len());
        for put in puts {
            latest.insert(&put.key, &put.item);
        }

        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO items (table_name, partition_key, sort_key, attributes) ",
        );
        query_builder.push_values(latest.iter(), |mut b, (key, item)| {
            b.push_bind(&key.table)
                .push_bind(&key.partition_key)
                .push_bind(&key.sort_key)
                .push_bind(Json((*item).clone()));
        });
        query_builder.push(
            " ON CONFLICT (table_name, partition_key, sort_key) DO UPDATE SET \
             attributes = EXCLUDED.attributes, updated_at = CURRENT_TIMESTAMP",
        );

        query_builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_chunk(&self, keys: &[ItemKey]) -> Result<()> {
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "DELETE FROM items WHERE (table_name, partition_key, sort_key) IN ",
        );
        query_builder.push_tuples(keys, |mut b, key| {
            b.push_bind(&key.table)
                .push_bind(&key.partition_key)
                .push_bind(&key.sort_key);
        });
        query_builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<(ItemKey, Item)> {
    let key = ItemKey {
        table: row.try_get("table_name")?,
        partition_key: row.try_get("partition_key")?,
        sort_key: row.try_get("sort_key")?,
    };
    let Json(item): Json<Item> = row.try_get("attributes")?;
    Ok((key, item))
}

#[async_trait]
impl PartitionedStore for PgStore {
    async fn batch_get(&self, keys: &[ItemKey]) -> Result<BatchGetOutput> {
        let mut output = BatchGetOutput::default();
        for chunk in keys.chunks(MAX_BATCH_ITEMS) {
            let chunk = chunk.to_vec();
            let found = retry_async(|| {
                let chunk = chunk.clone();
                async move { self.get_chunk(&chunk).await }.boxed()
            })
            .await?;
            output.items.extend(found);
        }
        Ok(output)
    }

    async fn conditional_put(&self, put: Put, condition: Condition) -> Result<PutOutcome> {
        let Put { key, item } = put;
        let result = match condition {
            Condition::Absent => {
                sqlx::query(
                    r#"
                    INSERT INTO items (table_name, partition_key, sort_key, attributes)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (table_name, partition_key, sort_key) DO NOTHING
                    "#,
                )
                .bind(&key.table)
                .bind(&key.partition_key)
                .bind(&key.sort_key)
                .bind(Json(&item))
                .execute(&self.pool)
                .await?
            }
            Condition::Exists => {
                sqlx::query(
                    r#"
                    UPDATE items
                    SET attributes = $4, updated_at = CURRENT_TIMESTAMP
                    WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
                    "#,
                )
                .bind(&key.table)
                .bind(&key.partition_key)
                .bind(&key.sort_key)
                .bind(Json(&item))
                .execute(&self.pool)
                .await?
            }
            Condition::AttributeEquals { attribute, value } => {
                sqlx::query(
                    r#"
                    UPDATE items
                    SET attributes = $4, updated_at = CURRENT_TIMESTAMP
                    WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
                      AND attributes -> $5 = $6
                    "#,
                )
                .bind(&key.table)
                .bind(&key.partition_key)
                .bind(&key.sort_key)
                .bind(Json(&item))
                .bind(&attribute)
                .bind(Json(&value))
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            Ok(PutOutcome::ConditionFailed)
        } else {
            Ok(PutOutcome::Written)
        }
    }

    async fn batch_write(&self, puts: Vec<Put>) -> Result<BatchWriteOutput> {
        for chunk in puts.chunks(MAX_BATCH_ITEMS) {
            let chunk = chunk.to_vec();
            retry_async(|| {
                let chunk = chunk.clone();
                async move { self.write_chunk(&chunk).await }.boxed()
            })
            .await?;
        }
        Ok(BatchWriteOutput::default())
    }

    async fn batch_delete(&self, keys: Vec<ItemKey>) -> Result<BatchDeleteOutput> {
        for chunk in keys.chunks(MAX_BATCH_ITEMS) {
            let chunk = chunk.to_vec();
            retry_async(|| {
                let chunk = chunk.clone();
                async move { self.delete_chunk(&chunk).await }.boxed()
            })
            .await?;
        }
        Ok(BatchDeleteOutput::default())
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryPage> {
        let limit = request.limit.max(1);
        let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT table_name, partition_key, sort_key, attributes FROM items WHERE table_name = ",
        );
        query_builder.push_bind(&request.table);
        query_builder.push(" AND partition_key = ");
        query_builder.push_bind(&request.partition_key);

        match &request.sort {
            SortKeyCondition::All => {}
            SortKeyCondition::Prefix(prefix) => {
                query_builder.push(" AND starts_with(sort_key, ");
                query_builder.push_bind(prefix);
                query_builder.push(")");
            }
            SortKeyCondition::Between(low, high) => {
                query_builder.push(" AND sort_key BETWEEN ");
                query_builder.push_bind(low);
                query_builder.push(" AND ");
                query_builder.push_bind(high);
            }
        }

        if let Some(start) = &request.exclusive_start_key {
            query_builder.push(if request.descending {
                " AND sort_key < "
            } else {
                " AND sort_key > "
            });
            query_builder.push_bind(start);
        }

        // COLLATE "C" keeps ordering byte-wise, matching the in-memory backend.
        query_builder.push(if request.descending {
            " ORDER BY sort_key COLLATE \"C\" DESC LIMIT "
        } else {
            " ORDER BY sort_key COLLATE \"C\" ASC LIMIT "
        });
        query_builder.push_bind(i64::try_from(limit + 1).unwrap_or(i64::MAX));

        let rows = query_builder.build().fetch_all(&self.pool).await?;
        let mut items = rows
            .into_iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>>>()?;

        let next_page_token = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|(key, _)| key.sort_key.clone())
        } else {
            None
        };

        Ok(QueryPage {
            items,
            next_page_token,
        })
    }

    async fn check_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn retry_async<'a, F, T>(mut operation: F) -> Result<T>
where
    F: FnMut() -> BoxFuture<'a, Result<T>>,
{
    let mut attempts = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempts += 1;
                if attempts > MAX_RETRIES || !is_transient_error(&e) {
                    return Err(e);
                }
                let backoff = Duration::from_secs(2_u64.pow(attempts));
                warn!(
                    "Operation failed with error: {:?}. Retrying in {:?} (Attempt {}/{})",
                    e, backoff, attempts, MAX_RETRIES
                );
                sleep(backoff).await;
            }
        }
    }
}

const fn is_transient_error(e: &BlockchainError) -> bool {
    matches!(e, BlockchainError::StoreUnavailable { .. })
}
