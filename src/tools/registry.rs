use std::sync::Arc;

use crate::error::CoreError;
use crate::event::{AuditEvent, EventHandler, NoopEventHandler, ToolStatus};
use crate::shield::{self, Grammar};
use crate::tools::{ToolDescriptor, ToolFn};
use crate::util::fnv1a_hash;

/// Fixed-capacity, name-hashed, open-addressed tool table. Bucket count is
/// always a power of two so `hash & (buckets - 1)` replaces a modulo.
/// `register` before the "static prefix" is closed assigns low ids; anything
/// registered afterward is the bounded "dynamic suffix".
pub struct ToolRegistry {
    buckets: Vec<Option<ToolDescriptor>>,
    mask: usize,
    len: usize,
    capacity: usize,
    next_id: u32,
    static_high_water: u32,
    event_handler: Arc<dyn EventHandler>,
}

impl ToolRegistry {
    /// `capacity` is rounded up to the next power of two.
    pub fn new(capacity: usize) -> Self {
        let buckets_len = capacity.max(1).next_power_of_two();
        ToolRegistry {
            buckets: (0..buckets_len).map(|_| None).collect(),
            mask: buckets_len - 1,
            len: 0,
            capacity: buckets_len,
            next_id: 0,
            static_high_water: 0,
            event_handler: Arc::new(NoopEventHandler),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Marks every tool registered so far as the static prefix; anything
    /// registered after this call counts toward the dynamic suffix only
    /// for bookkeeping/reporting purposes (capacity is still shared).
    pub fn close_static_prefix(&mut self) {
        self.static_high_water = self.next_id;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_for(&self, name: &str) -> usize {
        (fnv1a_hash(name.as_bytes()) as usize) & self.mask
    }

    /// `register(name, desc, func)`: succeeds only if the name is absent and
    /// the table is not full; assigns the next unused id.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        func: Arc<dyn ToolFn>,
    ) -> Result<u32, CoreError> {
        let name = name.into();
        if self.find_slot(&name).is_some() {
            return Err(CoreError::Config {
                reason: format!("tool '{name}' already registered"),
            });
        }
        if self.len >= self.capacity {
            return Err(CoreError::Full {
                what: "tool registry".to_string(),
            });
        }
        let start = self.bucket_for(&name);
        for step in 0..self.capacity {
            let idx = (start + step) & self.mask;
            if self.buckets[idx].is_none() {
                let id = self.next_id;
                self.next_id += 1;
                self.buckets[idx] = Some(ToolDescriptor {
                    id,
                    name,
                    description: description.into(),
                    func,
                });
                self.len += 1;
                return Ok(id);
            }
        }
        Err(CoreError::Full {
            what: "tool registry".to_string(),
        })
    }

    /// Linear probe from the name's home bucket; stops at the first empty
    /// slot (standard open-addressing lookup termination).
    fn find_slot(&self, name: &str) -> Option<usize> {
        let start = self.bucket_for(name);
        for step in 0..self.capacity {
            let idx = (start + step) & self.mask;
            match &self.buckets[idx] {
                Some(desc) if desc.name == name => return Some(idx),
                None => return None,
                Some(_) => continue,
            }
        }
        None
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.find_slot(name).and_then(|idx| self.buckets[idx].as_ref())
    }

    /// Removes a tool; lookup by that name afterward returns not-found and
    /// `len()` drops back by one.
    pub fn unregister(&mut self, name: &str) -> bool {
        if let Some(idx) = self.find_slot(name) {
            self.buckets[idx] = None;
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Enumerates descriptors in id order, for prompt assembly's bullet
    /// list.
    pub fn list_by_id(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<&ToolDescriptor> = self.buckets.iter().flatten().collect();
        all.sort_by_key(|d| d.id);
        all
    }

    /// `dispatch(name, args) → (output, error)`: resolve name, defensively
    /// re-validate it against the *command* grammar even though the Agent
    /// Loop already did, invoke, and emit one audit event regardless of
    /// outcome.
    pub async fn dispatch(&self, name: &str, args: &str) -> Result<String, CoreError> {
        if let Err(e) = shield::enforce(name.as_bytes(), Grammar::Command, "tool dispatch") {
            self.event_handler
                .on_event(AuditEvent::ToolExec {
                    tool: name.to_string(),
                    args: args.to_string(),
                    status: ToolStatus::Failure,
                })
                .await;
            return Err(e);
        }

        let descriptor = match self.get(name) {
            Some(d) => d,
            None => {
                self.event_handler
                    .on_event(AuditEvent::ToolExec {
                        tool: name.to_string(),
                        args: args.to_string(),
                        status: ToolStatus::Failure,
                    })
                    .await;
                return Err(CoreError::NotFound {
                    what: format!("tool '{name}'"),
                });
            }
        };

        let result = descriptor.func.call(args).await;
        self.event_handler
            .on_event(AuditEvent::ToolExec {
                tool: name.to_string(),
                args: args.to_string(),
                status: if result.is_ok() {
                    ToolStatus::Success
                } else {
                    ToolStatus::Failure
                },
            })
            .await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::SyncToolFn;

    fn echo_tool() -> Arc<dyn ToolFn> {
        Arc::new(SyncToolFn(|args: &str| Ok(args.to_string())))
    }

    #[tokio::test]
    async fn register_then_dispatch_roundtrips() {
        let mut registry = ToolRegistry::new(16);
        registry.register("echo", "returns its argument", echo_tool()).unwrap();
        let output = registry.dispatch("echo", "hi").await.unwrap();
        assert_eq!(output, "hi");
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = ToolRegistry::new(16);
        registry.register("echo", "d", echo_tool()).unwrap();
        let err = registry.register("echo", "d2", echo_tool()).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn register_unregister_restores_count() {
        let mut registry = ToolRegistry::new(16);
        let original_len = registry.len();
        registry.register("temp", "d", echo_tool()).unwrap();
        assert!(registry.unregister("temp"));
        assert_eq!(registry.len(), original_len);
        assert!(registry.get("temp").is_none());
    }

    #[tokio::test]
    async fn dispatch_missing_tool_is_not_found() {
        let registry = ToolRegistry::new(16);
        let err = registry.dispatch("nope", "").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn full_registry_rejects_further_registration() {
        let mut registry = ToolRegistry::new(2);
        registry.register("a", "d", echo_tool()).unwrap();
        registry.register("b", "d", echo_tool()).unwrap();
        let err = registry.register("c", "d", echo_tool()).unwrap_err();
        assert!(matches!(err, CoreError::Full { .. }));
    }

    #[tokio::test]
    async fn dispatch_rejects_name_outside_command_grammar() {
        let registry = ToolRegistry::new(16);
        let err = registry.dispatch("bad name;", "").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
    }

    #[test]
    fn list_by_id_is_sorted() {
        let mut registry = ToolRegistry::new(16);
        registry.register("b", "d", echo_tool()).unwrap();
        registry.register("a", "d", echo_tool()).unwrap();
        let ids: Vec<u32> = registry.list_by_id().iter().map(|d| d.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
