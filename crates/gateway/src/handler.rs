//! Tool execution seam

use async_trait::async_trait;
use serde_json::Value;
use shared::ToolError;
use std::future::Future;
use std::marker::PhantomData;

/// The function a registered tool runs when executed.
///
/// The gateway holds no lock while `call` is pending, so implementations
/// are free to suspend on I/O.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, params: Value) -> Result<Value, ToolError>;
}

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnTool<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTool<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, params: Value) -> Result<Value, ToolError> {
        (self.f)(params).await
    }
}
