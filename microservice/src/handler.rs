use std::future::Future;

use async_trait::async_trait;

use crate::context::ConsumerContext;

/// Application code run for every consumed record.
///
/// An `Err` is logged and published as an event; it never stops consumption
/// and never prevents the record from being marked processed. Implemented for
/// any `Fn(ConsumerContext) -> impl Future<Output = anyhow::Result<()>>`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, ctx: ConsumerContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(ConsumerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: ConsumerContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}
