//! Query shaping: pagination caps, sort-field mapping, plan hints and batching
//!
//! Plan hints are advisory. They are logged and cached by query shape but never
//! change which rows a query returns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Hard cap on rows per page
pub const MAX_LIMIT: u32 = 1000;
pub const DEFAULT_LIMIT: u32 = 50;
pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Logical sort fields → indexed physical columns
static SORT_FIELD_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("createdAt", "created_at"),
        ("updatedAt", "updated_at"),
        ("userId", "user_id"),
        ("ownerId", "user_id"),
        ("cardId", "card_id"),
        ("lastFour", "last_four"),
        ("expiresAt", "expires_at"),
        ("lastUsedAt", "last_used_at"),
        ("amount", "amount_cents"),
        ("email", "email_lower"),
    ])
});

/// Indexed columns per table, with the index name the schema creates for each
static INDEXES: Lazy<HashMap<&'static str, HashMap<&'static str, &'static str>>> =
    Lazy::new(|| {
        HashMap::from([
            (
                "cards",
                HashMap::from([
                    ("id", "cards_pkey"),
                    ("user_id", "idx_cards_user_id"),
                    ("status", "idx_cards_status"),
                    ("card_token", "idx_cards_card_token"),
                    ("created_at", "idx_cards_created_at"),
                ]),
            ),
            (
                "users",
                HashMap::from([
                    ("id", "users_pkey"),
                    ("email_lower", "idx_users_email_lower"),
                    ("kyc_tier", "idx_users_kyc_tier"),
                    ("created_at", "idx_users_created_at"),
                ]),
            ),
            (
                "transactions",
                HashMap::from([
                    ("id", "transactions_pkey"),
                    ("card_id", "idx_transactions_card_id"),
                    ("user_id", "idx_transactions_user_id"),
                    ("status", "idx_transactions_status"),
                    ("created_at", "idx_transactions_created_at"),
                ]),
            ),
        ])
    });

/// Map a logical field name to its physical column.
pub fn physical_field(field: &str) -> &str {
    SORT_FIELD_MAP.get(field).copied().unwrap_or(field)
}

fn index_for(table: &str, column: &str) -> Option<&'static str> {
    INDEXES.get(table).and_then(|indexes| indexes.get(column)).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One filter predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Between(Value, Value),
}

impl Condition {
    /// Operator name, without the operand values.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::In(_) => "in",
            Self::Gt(_) => "gt",
            Self::Gte(_) => "gte",
            Self::Lt(_) => "lt",
            Self::Lte(_) => "lte",
            Self::Between(..) => "between",
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Self::Gt(_) | Self::Gte(_) | Self::Lt(_) | Self::Lte(_) | Self::Between(..)
        )
    }
}

/// Filters plus pagination for list-style reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    pub conditions: BTreeMap<String, Condition>,
    pub sort_by: Option<String>,
    pub sort_order: SortOrder,
    pub limit: Option<u32>,
    pub page: Option<u32>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(field.into(), condition);
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(field.into());
        self.sort_order = order;
        self
    }

    pub fn paginate(mut self, page: u32, limit: u32) -> Self {
        self.page = Some(page);
        self.limit = Some(limit);
        self
    }

    /// Row offset for the current page; call after normalization.
    pub fn offset(&self) -> u64 {
        let page = self.page.unwrap_or(DEFAULT_PAGE).max(1) as u64;
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT) as u64;
        (page - 1) * limit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub order: SortOrder,
}

/// Projection and ordering for a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStrategy {
    IndexScan,
    SequentialScan,
    BitmapScan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub strategy: ScanStrategy,
    pub use_index: Option<String>,
    pub optimizations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryPlanStats {
    pub cached_plans: usize,
    pub hits: u64,
    pub misses: u64,
}

fn normalize_page(limit: Option<u32>, page: Option<u32>) -> (u32, u32) {
    let limit = match limit {
        Some(0) | None => DEFAULT_LIMIT,
        Some(l) if l > MAX_LIMIT => {
            info!(requested = l, max = MAX_LIMIT, "query limit clamped");
            MAX_LIMIT
        }
        Some(l) => l,
    };
    (limit, page.unwrap_or(DEFAULT_PAGE).max(1))
}

/// Memo key for a plan: the table, the filtered columns with their operator kinds,
/// and the sort columns. Operand values are never part of the key.
fn shape_key(table: &str, filters: Option<&QueryFilters>, options: Option<&QueryOptions>) -> String {
    let mut conditions: Vec<String> = filters
        .into_iter()
        .flat_map(|f| f.conditions.iter())
        .map(|(field, condition)| format!("{}:{}", physical_field(field), condition.kind()))
        .collect();
    conditions.sort_unstable();

    let sorts: Vec<&str> = filters
        .and_then(|f| f.sort_by.as_deref())
        .into_iter()
        .chain(options.into_iter().flat_map(|o| o.order_by.iter().map(|ob| ob.field.as_str())))
        .map(physical_field)
        .collect();

    format!("{table}|{}|{}", conditions.join(","), sorts.join(","))
}

#[derive(Default)]
pub struct QueryOptimizer {
    plans: Mutex<HashMap<String, QueryPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryOptimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap and default pagination, and map the sort field to its indexed column.
    pub fn optimize_filters(&self, filters: &QueryFilters) -> QueryFilters {
        let mut out = filters.clone();
        let (limit, page) = normalize_page(filters.limit, filters.page);
        out.limit = Some(limit);
        out.page = Some(page);
        if let Some(field) = &filters.sort_by {
            out.sort_by = Some(physical_field(field).to_string());
        }
        out
    }

    /// Drop an empty projection, remap ordering, and apply the pagination rules.
    pub fn optimize_query_options(&self, options: &QueryOptions) -> QueryOptions {
        let (limit, page) = normalize_page(options.limit, options.page);
        QueryOptions {
            select: options.select.clone().filter(|fields| !fields.is_empty()),
            order_by: options
                .order_by
                .iter()
                .map(|o| OrderBy {
                    field: physical_field(&o.field).to_string(),
                    order: o.order,
                })
                .collect(),
            limit: Some(limit),
            page: Some(page),
        }
    }

    /// Advisory plan hint, memoized by query shape.
    pub fn analyze_query_pattern(
        &self,
        table: &str,
        filters: Option<&QueryFilters>,
        options: Option<&QueryOptions>,
    ) -> QueryPlan {
        let key = shape_key(table, filters, options);

        if let Ok(plans) = self.plans.lock() {
            if let Some(plan) = plans.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return plan.clone();
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let plan = Self::plan(table, filters, options);
        debug!(table, strategy = ?plan.strategy, index = ?plan.use_index, "query plan hint");
        if let Ok(mut plans) = self.plans.lock() {
            plans.insert(key, plan.clone());
        }
        plan
    }

    fn plan(table: &str, filters: Option<&QueryFilters>, options: Option<&QueryOptions>) -> QueryPlan {
        let mut plan = QueryPlan {
            strategy: ScanStrategy::SequentialScan,
            use_index: None,
            optimizations: Vec::new(),
        };

        if let Some(filters) = filters {
            let mut columns: Vec<&str> = filters
                .conditions
                .keys()
                .map(|field| physical_field(field))
                .collect();
            columns.sort_unstable();
            if let Some(index) = columns.into_iter().find_map(|column| index_for(table, column)) {
                plan.strategy = ScanStrategy::IndexScan;
                plan.use_index = Some(index.to_string());
            }
            if filters.conditions.values().any(Condition::is_range) {
                plan.strategy = ScanStrategy::BitmapScan;
                plan.optimizations
                    .push("range predicate: bitmap scan combines index matches".to_string());
            }
        }

        let sort_fields = filters
            .and_then(|f| f.sort_by.iter().next().cloned())
            .into_iter()
            .chain(options.into_iter().flat_map(|o| o.order_by.iter().map(|ob| ob.field.clone())));
        for field in sort_fields {
            let column = physical_field(&field);
            if let Some(index) = index_for(table, column) {
                plan.optimizations
                    .push(format!("sort on {column} can use {index}"));
            } else {
                plan.optimizations
                    .push(format!("consider adding an index on {table}.{column} for sorting"));
            }
        }

        plan
    }

    pub fn clear_query_plans(&self) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.clear();
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn query_plan_stats(&self) -> QueryPlanStats {
        QueryPlanStats {
            cached_plans: self.plans.lock().map(|p| p.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Run `executor` once per chunk of `batch_size` operations, sequentially, and
    /// concatenate the results. Stops at the first failing chunk.
    pub async fn batch_operations<T, R, E, F, Fut>(
        &self,
        operations: Vec<T>,
        mut executor: F,
        batch_size: usize,
    ) -> Result<Vec<R>, E>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<R>, E>>,
    {
        let batch_size = batch_size.max(1);
        let mut results = Vec::with_capacity(operations.len());
        let mut remaining = operations.into_iter().peekable();
        let mut batches = 0;

        while remaining.peek().is_some() {
            let chunk: Vec<T> = remaining.by_ref().take(batch_size).collect();
            results.extend(executor(chunk).await?);
            batches += 1;
        }

        debug!(batches, batch_size, "batched operations complete");
        Ok(results)
    }

    /// Resolve children for many parents with one fetch per batch of parent ids.
    pub async fn prevent_n_plus_one<K, R, E, F, Fut>(
        &self,
        parent_ids: Vec<K>,
        mut fetch: F,
        batch_size: usize,
    ) -> Result<HashMap<K, Vec<R>>, E>
    where
        K: Eq + Hash + Clone,
        F: FnMut(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, Vec<R>>, E>>,
    {
        let mut seen = HashSet::new();
        let unique: Vec<K> = parent_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        let mut merged: HashMap<K, Vec<R>> = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(batch_size.max(1)) {
            for (id, children) in fetch(chunk.to_vec()).await? {
                merged.entry(id).or_default().extend(children);
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    #[test]
    fn limit_is_capped_and_defaults_apply() {
        let optimizer = QueryOptimizer::new();

        let capped = optimizer.optimize_filters(&QueryFilters {
            limit: Some(5000),
            ..QueryFilters::default()
        });
        assert_eq!(capped.limit, Some(1000));
        assert_eq!(capped.page, Some(1));

        let defaulted = optimizer.optimize_filters(&QueryFilters::default());
        assert_eq!((defaulted.limit, defaulted.page), (Some(50), Some(1)));
    }

    #[test]
    fn sort_fields_map_to_indexed_columns() {
        let optimizer = QueryOptimizer::new();
        let filters = optimizer.optimize_filters(&QueryFilters::new().sort("createdAt", SortOrder::Desc));
        assert_eq!(filters.sort_by.as_deref(), Some("created_at"));
        assert_eq!(filters.sort_order, SortOrder::Desc);

        let untouched = optimizer.optimize_filters(&QueryFilters::new().sort("status", SortOrder::Asc));
        assert_eq!(untouched.sort_by.as_deref(), Some("status"));
    }

    #[test]
    fn query_options_drop_empty_select_and_remap_order() {
        let optimizer = QueryOptimizer::new();
        let options = optimizer.optimize_query_options(&QueryOptions {
            select: Some(vec![]),
            order_by: vec![OrderBy {
                field: "updatedAt".into(),
                order: SortOrder::Desc,
            }],
            limit: Some(20_000),
            page: None,
        });

        assert_eq!(options.select, None);
        assert_eq!(options.order_by[0].field, "updated_at");
        assert_eq!((options.limit, options.page), (Some(1000), Some(1)));

        let kept = optimizer.optimize_query_options(&QueryOptions {
            select: Some(vec!["id".into()]),
            ..QueryOptions::default()
        });
        assert_eq!(kept.select, Some(vec!["id".to_string()]));
    }

    #[test]
    fn plan_strategies() {
        let optimizer = QueryOptimizer::new();

        let indexed = QueryFilters::new().eq("userId", "u1");
        let plan = optimizer.analyze_query_pattern("cards", Some(&indexed), None);
        assert_eq!(plan.strategy, ScanStrategy::IndexScan);
        assert_eq!(plan.use_index.as_deref(), Some("idx_cards_user_id"));

        let ranged = QueryFilters::new().with("created_at", Condition::Gte(json!("2026-01-01")));
        let plan = optimizer.analyze_query_pattern("cards", Some(&ranged), None);
        assert_eq!(plan.strategy, ScanStrategy::BitmapScan);

        let unindexed = QueryFilters::new().eq("nickname", "travel");
        let plan = optimizer.analyze_query_pattern("cards", Some(&unindexed), None);
        assert_eq!(plan.strategy, ScanStrategy::SequentialScan);
        assert_eq!(plan.use_index, None);
    }

    #[test]
    fn sort_analysis_is_advisory_only() {
        let optimizer = QueryOptimizer::new();
        let filters = QueryFilters::new()
            .eq("nickname", "travel")
            .sort("amount", SortOrder::Desc);
        let plan = optimizer.analyze_query_pattern("cards", Some(&filters), None);

        assert_eq!(plan.strategy, ScanStrategy::SequentialScan);
        assert!(plan.optimizations[0].contains("consider adding an index on cards.amount_cents"));

        let options = QueryOptions {
            order_by: vec![OrderBy {
                field: "createdAt".into(),
                order: SortOrder::Asc,
            }],
            ..QueryOptions::default()
        };
        let plan = optimizer.analyze_query_pattern("cards", None, Some(&options));
        assert_eq!(plan.strategy, ScanStrategy::SequentialScan);
        assert!(plan.optimizations[0].contains("idx_cards_created_at"));
    }

    #[test]
    fn plans_are_memoized_by_shape() {
        let optimizer = QueryOptimizer::new();
        let filters = QueryFilters::new().eq("status", "active");

        optimizer.analyze_query_pattern("cards", Some(&filters), None);
        optimizer.analyze_query_pattern("cards", Some(&filters), None);
        optimizer.analyze_query_pattern("users", Some(&filters), None);

        assert_eq!(
            optimizer.query_plan_stats(),
            QueryPlanStats {
                cached_plans: 2,
                hits: 1,
                misses: 2
            }
        );

        optimizer.clear_query_plans();
        assert_eq!(optimizer.query_plan_stats().cached_plans, 0);
    }

    #[test]
    fn plan_memo_ignores_operand_values() {
        let optimizer = QueryOptimizer::new();
        for i in 0..1000 {
            let filters = QueryFilters::new()
                .eq("user_id", format!("user-{i}"))
                .paginate(i % 7 + 1, 25);
            optimizer.analyze_query_pattern("cards", Some(&filters), None);
        }
        assert_eq!(
            optimizer.query_plan_stats(),
            QueryPlanStats {
                cached_plans: 1,
                hits: 999,
                misses: 1
            }
        );

        // logical and physical names of one column share a shape
        let logical = QueryFilters::new().eq("userId", "u1");
        optimizer.analyze_query_pattern("cards", Some(&logical), None);
        assert_eq!(optimizer.query_plan_stats().cached_plans, 1);

        // a different operator is a different shape
        let ranged = QueryFilters::new().with("user_id", Condition::In(vec![json!("u1")]));
        optimizer.analyze_query_pattern("cards", Some(&ranged), None);
        let sorted = QueryFilters::new().eq("user_id", "u1").sort("createdAt", SortOrder::Asc);
        optimizer.analyze_query_pattern("cards", Some(&sorted), None);
        assert_eq!(optimizer.query_plan_stats().cached_plans, 3);
    }

    #[test]
    fn card_index_hints_name_indexes_the_migration_creates() {
        let schema = include_str!("../migrations/20260101000000_cards.sql");
        let optimizer = QueryOptimizer::new();

        for column in ["user_id", "status", "card_token", "created_at"] {
            let filters = QueryFilters::new().eq(column, "x");
            let plan = optimizer.analyze_query_pattern("cards", Some(&filters), None);
            let index = plan.use_index.expect("indexed column");
            assert!(schema.contains(&format!("INDEX IF NOT EXISTS {index} ")), "{index} missing");
        }

        let by_id = QueryFilters::new().eq("id", "x");
        let plan = optimizer.analyze_query_pattern("cards", Some(&by_id), None);
        assert_eq!(plan.use_index.as_deref(), Some("cards_pkey"));
        assert!(schema.contains("id UUID PRIMARY KEY"));
    }

    #[tokio::test]
    async fn batches_are_fixed_size_and_sequential() {
        let optimizer = QueryOptimizer::new();
        let seen = RefCell::new(Vec::new());

        let results = optimizer
            .batch_operations(
                (1..=250).collect::<Vec<u32>>(),
                |chunk| {
                    seen.borrow_mut().push(chunk.len());
                    async move { Ok::<_, ()>(chunk.into_iter().map(|n| n * 2).collect::<Vec<_>>()) }
                },
                DEFAULT_BATCH_SIZE,
            )
            .await
            .unwrap();

        assert_eq!(*seen.borrow(), vec![100, 100, 50]);
        assert_eq!(results.len(), 250);
        assert_eq!(results[249], 500);
    }

    #[tokio::test]
    async fn batch_stops_at_first_error() {
        let optimizer = QueryOptimizer::new();
        let mut calls = 0;
        let result = optimizer
            .batch_operations(
                vec![1, 2, 3, 4],
                |chunk: Vec<i32>| {
                    calls += 1;
                    let fail = chunk.contains(&3);
                    async move {
                        if fail {
                            Err("chunk failed")
                        } else {
                            Ok(chunk)
                        }
                    }
                },
                2,
            )
            .await;

        assert_eq!(result, Err("chunk failed"));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn n_plus_one_batches_parent_lookups() {
        let optimizer = QueryOptimizer::new();
        let mut fetches = 0;

        let parents: Vec<String> = (0..230).map(|i| format!("u{i}")).chain(["u0".to_string()]).collect();
        let children = optimizer
            .prevent_n_plus_one(
                parents,
                |ids: Vec<String>| {
                    fetches += 1;
                    async move {
                        Ok::<_, ()>(
                            ids.into_iter()
                                .map(|id| (id.clone(), vec![format!("{id}-card")]))
                                .collect::<HashMap<_, _>>(),
                        )
                    }
                },
                DEFAULT_BATCH_SIZE,
            )
            .await
            .unwrap();

        assert_eq!(fetches, 3);
        assert_eq!(children.len(), 230);
        assert_eq!(children["u0"], vec!["u0-card".to_string()]);
    }
}
