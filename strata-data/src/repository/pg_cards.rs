//! PostgreSQL card store
//!
//! Reads run on the `read` pool, writes on the `write` pool. Filtered queries are
//! assembled with `QueryBuilder` and only ever reference whitelisted columns.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::migrate::Migrator;
use sqlx::{Connection, FromRow, Postgres, QueryBuilder};
use uuid::Uuid;

use super::cards::{Card, CardPatch, CardStatus, NewCard};
use super::{Change, EntityStore};
use crate::error::{DataError, DataResult};
use crate::pool::postgres::PgConnector;
use crate::pool::PoolManager;
use crate::query::{physical_field, Condition, QueryFilters, SortOrder, DEFAULT_LIMIT, MAX_LIMIT};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Filterable columns and the SQL type bound values are cast to.
const COLUMNS: &[(&str, &str)] = &[
    ("id", "uuid"),
    ("user_id", "uuid"),
    ("card_token", "text"),
    ("last_four", "text"),
    ("brand", "text"),
    ("nickname", "text"),
    ("status", "text"),
    ("spending_limit_cents", "bigint"),
    ("created_at", "timestamptz"),
    ("updated_at", "timestamptz"),
];

const SELECT_CARDS: &str = "SELECT id, user_id, card_token, last_four, brand, nickname, status, \
                            spending_limit_cents, created_at, updated_at FROM cards";

const RETURNING: &str = " RETURNING id, user_id, card_token, last_four, brand, nickname, status, \
                         spending_limit_cents, created_at, updated_at";

#[derive(Debug, FromRow)]
struct CardRow {
    id: Uuid,
    user_id: Uuid,
    card_token: String,
    last_four: String,
    brand: String,
    nickname: Option<String>,
    status: String,
    spending_limit_cents: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CardRow> for Card {
    type Error = DataError;

    fn try_from(row: CardRow) -> Result<Self, Self::Error> {
        Ok(Card {
            id: row.id,
            user_id: row.user_id,
            card_token: row.card_token,
            last_four: row.last_four,
            brand: row.brand,
            nickname: row.nickname,
            status: row.status.parse::<CardStatus>()?,
            spending_limit_cents: row.spending_limit_cents,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn column(field: &str) -> DataResult<(&'static str, &'static str)> {
    let physical = physical_field(field);
    COLUMNS
        .iter()
        .find(|(name, _)| *name == physical)
        .copied()
        .ok_or_else(|| DataError::store(format!("cards cannot be filtered or sorted by '{field}'")))
}

fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &Value, sql_type: &str) {
    match value {
        Value::Null => qb.push("NULL"),
        Value::Bool(b) => qb.push_bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => qb.push_bind(i),
            None => qb.push_bind(n.as_f64()),
        },
        Value::String(s) => qb.push_bind(s.clone()),
        other => qb.push_bind(other.to_string()),
    };
    qb.push("::").push(sql_type);
}

/// `SELECT` over `cards` for the given filters. `single` limits to one row and
/// ignores pagination.
fn build_select(filters: &QueryFilters, single: bool) -> DataResult<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::new(SELECT_CARDS);
    qb.push(" WHERE TRUE");

    for (field, condition) in &filters.conditions {
        let (name, sql_type) = column(field)?;
        qb.push(" AND ").push(name);
        match condition {
            Condition::Eq(v) => {
                qb.push(" = ");
                push_value(&mut qb, v, sql_type);
            }
            Condition::In(values) if values.is_empty() => {
                qb.push(" IN (NULL)");
            }
            Condition::In(values) => {
                qb.push(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    push_value(&mut qb, v, sql_type);
                }
                qb.push(")");
            }
            Condition::Gt(v) => {
                qb.push(" > ");
                push_value(&mut qb, v, sql_type);
            }
            Condition::Gte(v) => {
                qb.push(" >= ");
                push_value(&mut qb, v, sql_type);
            }
            Condition::Lt(v) => {
                qb.push(" < ");
                push_value(&mut qb, v, sql_type);
            }
            Condition::Lte(v) => {
                qb.push(" <= ");
                push_value(&mut qb, v, sql_type);
            }
            Condition::Between(low, high) => {
                qb.push(" BETWEEN ");
                push_value(&mut qb, low, sql_type);
                qb.push(" AND ");
                push_value(&mut qb, high, sql_type);
            }
        }
    }

    let (sort_column, order) = match &filters.sort_by {
        Some(field) => (column(field)?.0, filters.sort_order),
        None => ("created_at", SortOrder::Desc),
    };
    qb.push(" ORDER BY ").push(sort_column).push(match order {
        SortOrder::Asc => " ASC",
        SortOrder::Desc => " DESC",
    });

    if single {
        qb.push(" LIMIT 1");
    } else {
        let limit = filters.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let page = filters.page.unwrap_or(1).max(1);
        qb.push(" LIMIT ").push_bind(limit as i64);
        qb.push(" OFFSET ").push_bind(((page - 1) as i64) * limit as i64);
    }
    Ok(qb)
}

/// Card persistence over pooled PostgreSQL sessions.
#[derive(Clone)]
pub struct PgCardStore {
    pools: Arc<PoolManager<PgConnector>>,
    read_pool: String,
    write_pool: String,
}

impl PgCardStore {
    pub fn new(pools: Arc<PoolManager<PgConnector>>) -> Self {
        Self {
            pools,
            read_pool: "read".to_string(),
            write_pool: "write".to_string(),
        }
    }

    pub fn with_pools(mut self, read_pool: impl Into<String>, write_pool: impl Into<String>) -> Self {
        self.read_pool = read_pool.into();
        self.write_pool = write_pool.into();
        self
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> DataResult<()> {
        self.pools
            .execute_with_connection(&self.write_pool, |conn| {
                Box::pin(async move {
                    MIGRATOR
                        .run_direct(conn)
                        .await
                        .map_err(|e| DataError::store(format!("migration failed: {e}")))
                })
            })
            .await
    }
}

#[async_trait]
impl EntityStore for PgCardStore {
    type Entity = Card;
    type Draft = NewCard;
    type Patch = CardPatch;

    async fn find_by_id(&self, id: &str) -> DataResult<Option<Card>> {
        let Ok(id) = Uuid::parse_str(id) else {
            return Ok(None);
        };
        self.pools
            .execute_with_connection(&self.read_pool, move |conn| {
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Postgres>::new(SELECT_CARDS);
                    qb.push(" WHERE id = ").push_bind(id);
                    let row: Option<CardRow> =
                        qb.build_query_as().fetch_optional(&mut *conn).await?;
                    row.map(Card::try_from).transpose()
                })
            })
            .await
    }

    async fn find_one(&self, filters: &QueryFilters) -> DataResult<Option<Card>> {
        let mut qb = build_select(filters, true)?;
        self.pools
            .execute_with_connection(&self.read_pool, move |conn| {
                Box::pin(async move {
                    let row: Option<CardRow> =
                        qb.build_query_as().fetch_optional(&mut *conn).await?;
                    row.map(Card::try_from).transpose()
                })
            })
            .await
    }

    async fn find_many(&self, filters: &QueryFilters) -> DataResult<Vec<Card>> {
        let mut qb = build_select(filters, false)?;
        self.pools
            .execute_with_connection(&self.read_pool, move |conn| {
                Box::pin(async move {
                    let rows: Vec<CardRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
                    rows.into_iter().map(Card::try_from).collect()
                })
            })
            .await
    }

    async fn create(&self, draft: NewCard) -> DataResult<Card> {
        self.pools
            .execute_with_connection(&self.write_pool, move |conn| {
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Postgres>::new(
                        "INSERT INTO cards (id, user_id, card_token, last_four, brand, nickname, \
                         status, spending_limit_cents) ",
                    );
                    qb.push_values(std::iter::once(draft), |mut row, draft| {
                        row.push_bind(Uuid::new_v4())
                            .push_bind(draft.user_id)
                            .push_bind(draft.card_token)
                            .push_bind(draft.last_four)
                            .push_bind(draft.brand)
                            .push_bind(draft.nickname)
                            .push_bind(CardStatus::Active.as_str())
                            .push_bind(draft.spending_limit_cents);
                    });
                    qb.push(RETURNING);
                    let row: CardRow = qb.build_query_as().fetch_one(&mut *conn).await?;
                    Card::try_from(row)
                })
            })
            .await
    }

    async fn update(&self, id: &str, patch: CardPatch) -> DataResult<Change<Card>> {
        let not_found = || DataError::NotFound {
            resource: "card",
            id: id.to_string(),
        };
        let card_id = Uuid::parse_str(id).map_err(|_| not_found())?;

        let change = self
            .pools
            .execute_with_connection(&self.write_pool, move |conn| {
                Box::pin(async move {
                    let mut tx = conn.begin().await?;

                    let mut select = QueryBuilder::<Postgres>::new(SELECT_CARDS);
                    select.push(" WHERE id = ").push_bind(card_id).push(" FOR UPDATE");
                    let previous: Option<CardRow> =
                        select.build_query_as().fetch_optional(&mut *tx).await?;
                    let Some(previous) = previous else {
                        return Ok(None);
                    };

                    let mut update = QueryBuilder::<Postgres>::new("UPDATE cards SET user_id = COALESCE(");
                    update
                        .push_bind(patch.user_id)
                        .push(", user_id), nickname = COALESCE(")
                        .push_bind(patch.nickname)
                        .push(", nickname), status = COALESCE(")
                        .push_bind(patch.status.map(|s| s.as_str()))
                        .push(", status), spending_limit_cents = COALESCE(")
                        .push_bind(patch.spending_limit_cents)
                        .push(", spending_limit_cents), updated_at = now() WHERE id = ")
                        .push_bind(card_id)
                        .push(RETURNING);
                    let current: CardRow = update.build_query_as().fetch_one(&mut *tx).await?;

                    tx.commit().await?;
                    Ok(Some(Change {
                        previous: Card::try_from(previous)?,
                        current: Card::try_from(current)?,
                    }))
                })
            })
            .await?;

        change.ok_or_else(not_found)
    }

    async fn delete(&self, id: &str) -> DataResult<Option<Card>> {
        let Ok(id) = Uuid::parse_str(id) else {
            return Ok(None);
        };
        self.pools
            .execute_with_connection(&self.write_pool, move |conn| {
                Box::pin(async move {
                    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM cards WHERE id = ");
                    qb.push_bind(id).push(RETURNING);
                    let row: Option<CardRow> =
                        qb.build_query_as().fetch_optional(&mut *conn).await?;
                    row.map(Card::try_from).transpose()
                })
            })
            .await
    }
}
