//! Tool registry and dispatcher.
//!
//! A fixed-capacity table of `(name, description, function)` descriptors
//! with a static prefix (known at load time) and a bounded dynamic suffix.
//! Lookup is a name-hashed open-addressed probe.

pub mod builtin;
mod registry;

pub use registry::ToolRegistry;

use async_trait::async_trait;

use crate::error::CoreError;

/// `(args) → output`. Tools are thin and uniform: read the argument string,
/// produce a string, return. They must never hold a reference past return —
/// there's nothing to hold, since the signature is owned in and owned out.
#[async_trait]
pub trait ToolFn: Send + Sync {
    async fn call(&self, args: &str) -> Result<String, CoreError>;
}

/// Adapts a plain synchronous closure into a [`ToolFn`], for the common
/// case of a tool with no I/O.
pub struct SyncToolFn<F>(pub F)
where
    F: Fn(&str) -> Result<String, CoreError> + Send + Sync;

#[async_trait]
impl<F> ToolFn for SyncToolFn<F>
where
    F: Fn(&str) -> Result<String, CoreError> + Send + Sync,
{
    async fn call(&self, args: &str) -> Result<String, CoreError> {
        (self.0)(args)
    }
}

/// `(id, name, description, function)`. The table has a static prefix
/// (ids assigned at registry construction) and a dynamic suffix (ids
/// auto-assigned beyond the static high-water mark).
pub struct ToolDescriptor {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub func: std::sync::Arc<dyn ToolFn>,
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}
