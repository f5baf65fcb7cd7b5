//! Liveness probes.

use async_trait::async_trait;
use std::fmt;

use crate::errors::FlowResult;

/// A liveness check for one named dependency.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns whether the dependency is healthy. An error counts as
    /// unhealthy.
    async fn check(&self) -> FlowResult<bool>;
}

/// A probe backed by a synchronous closure.
pub struct FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    func: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    /// Creates a closure probe.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> HealthProbe for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn check(&self) -> FlowResult<bool> {
        Ok((self.func)())
    }
}
