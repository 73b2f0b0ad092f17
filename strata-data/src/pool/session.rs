//! Session contracts backing pool slots
//!
//! Every slot owns an independent session. A checked-out session is moved out of its
//! slot, so two holders can never share one.

use async_trait::async_trait;

use crate::error::DataResult;

#[async_trait]
pub trait Session: Send + 'static {
    /// Trivial round trip used by health checks.
    async fn probe(&mut self) -> DataResult<()>;
}

/// Opens new sessions for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> DataResult<Self::Session>;
}
