//! Payment cards
//!
//! Writes to a card invalidate:
//! - `cards:{id}`
//! - `cards:list:*`
//! - `cards:owner:{user_id}` for the owner before and after the write
//! - `cards:token:{card_token}`

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::RepositorySettings;
use uuid::Uuid;

use super::{CacheTarget, CachedRepository, EntityStore, Entity, RepositoryContext};
use crate::error::{DataError, DataResult};
use crate::query::{QueryFilters, SortOrder};

pub const CARDS: &str = "cards";

/// Owner lookups change more often than single cards.
pub const OWNER_LOOKUP_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Active,
    Frozen,
    Cancelled,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Frozen => "frozen",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardStatus {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "frozen" => Ok(Self::Frozen),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DataError::store(format!("unknown card status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub card_token: String,
    pub last_four: String,
    pub brand: String,
    pub nickname: Option<String>,
    pub status: CardStatus,
    pub spending_limit_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for Card {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn cache_targets(&self, namespace: &str) -> Vec<CacheTarget> {
        vec![
            CacheTarget::entry(format!("{namespace}:owner"), self.user_id.to_string()),
            CacheTarget::entry(format!("{namespace}:token"), self.card_token.clone()),
        ]
    }
}

/// Fields for a new card. Status starts as active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCard {
    pub user_id: Uuid,
    pub card_token: String,
    pub last_four: String,
    pub brand: String,
    pub nickname: Option<String>,
    pub spending_limit_cents: Option<i64>,
}

/// Partial update. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardPatch {
    /// Reassign the card to another user
    pub user_id: Option<Uuid>,
    pub nickname: Option<String>,
    pub status: Option<CardStatus>,
    pub spending_limit_cents: Option<i64>,
}

impl CardPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn status(status: CardStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, card: &mut Card) {
        if let Some(user_id) = self.user_id {
            card.user_id = user_id;
        }
        if let Some(nickname) = &self.nickname {
            card.nickname = Some(nickname.clone());
        }
        if let Some(status) = self.status {
            card.status = status;
        }
        if let Some(limit) = self.spending_limit_cents {
            card.spending_limit_cents = Some(limit);
        }
        card.updated_at = Utc::now();
    }
}

pub struct CardRepository<S>
where
    S: EntityStore<Entity = Card, Draft = NewCard, Patch = CardPatch>,
{
    base: CachedRepository<S>,
}

impl<S> CardRepository<S>
where
    S: EntityStore<Entity = Card, Draft = NewCard, Patch = CardPatch>,
{
    pub fn new(store: S, ctx: RepositoryContext, settings: RepositorySettings) -> Self {
        Self {
            base: CachedRepository::new(CARDS, store, ctx, settings),
        }
    }

    /// Active cards for one user, newest first.
    pub async fn find_active_by_owner(&self, user_id: Uuid) -> DataResult<Vec<Card>> {
        let filters = QueryFilters::new()
            .eq("user_id", user_id.to_string())
            .eq("status", CardStatus::Active.as_str())
            .sort("createdAt", SortOrder::Desc);
        let options = self.base.options().with_ttl(OWNER_LOOKUP_TTL);
        let namespace = format!("{CARDS}:owner");

        self.base
            .cached(
                "find_active_by_owner",
                &namespace,
                &user_id.to_string(),
                &options,
                || self.base.store().find_many(&filters),
            )
            .await
    }

    pub async fn find_by_token(&self, card_token: &str) -> DataResult<Option<Card>> {
        let filters = QueryFilters::new().eq("card_token", card_token);
        let options = self
            .base
            .options()
            .cache_null(self.base.settings().cache_null_values);
        let namespace = format!("{CARDS}:token");

        self.base
            .cached("find_by_token", &namespace, card_token, &options, || {
                self.base.store().find_one(&filters)
            })
            .await
    }

    /// Look up a card by id, failing if it does not exist.
    pub async fn get(&self, id: Uuid) -> DataResult<Card> {
        self.base
            .find_by_id(&id.to_string())
            .await?
            .ok_or_else(|| DataError::NotFound {
                resource: "card",
                id: id.to_string(),
            })
    }

    pub async fn freeze(&self, id: Uuid) -> DataResult<Card> {
        self.base
            .update(&id.to_string(), CardPatch::status(CardStatus::Frozen))
            .await
    }
}

impl<S> Deref for CardRepository<S>
where
    S: EntityStore<Entity = Card, Draft = NewCard, Patch = CardPatch>,
{
    type Target = CachedRepository<S>;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}
