//! PostgreSQL sessions for the pool manager
//!
//! Each slot owns its own `PgConnection`, so admission control in the pool is real
//! concurrency control against the server rather than bookkeeping over one handle.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;

use super::{Connector, Session};
use crate::error::DataResult;

/// Opens independent PostgreSQL connections.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    /// Parse a `postgres://` URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed.
    pub fn from_url(database_url: &str) -> DataResult<Self> {
        Ok(Self {
            options: PgConnectOptions::from_str(database_url)?,
        })
    }

    pub fn with_options(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgConnection;

    async fn connect(&self) -> DataResult<PgConnection> {
        Ok(PgConnection::connect_with(&self.options).await?)
    }
}

#[async_trait]
impl Session for PgConnection {
    async fn probe(&mut self) -> DataResult<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&mut *self).await?;
        Ok(())
    }
}
