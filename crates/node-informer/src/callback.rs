//! Typed callback registration.
//!
//! Consumers register named callbacks against an [`ObjectKind`] once, while the
//! informer is being wired. Every time fresh state of that kind is applied, the
//! kind's [`CallbackRunner`](crate::runner::CallbackRunner) invokes the callbacks
//! in registration order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use error_stack::Report;
use tracing::info;

use crate::error::InformerError;
use crate::states::StatesReader;

/// Kinds of state observed by the informer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ObjectKind {
    #[display("Node")]
    Node,
    #[display("NodeSLO")]
    NodeSlo,
    #[display("Pods")]
    Pods,
}

impl ObjectKind {
    /// Kinds that accept callback registrations.
    pub const REGISTRABLE: [ObjectKind; 2] = [ObjectKind::Node, ObjectKind::NodeSlo];

    pub fn is_registrable(self) -> bool {
        Self::REGISTRABLE.contains(&self)
    }
}

/// Callback invoked with a read-only view of the whole informer state.
pub type UpdateCallbackFn = Arc<dyn Fn(&dyn StatesReader) -> anyhow::Result<()> + Send + Sync>;

/// A named callback registered for one [`ObjectKind`].
#[derive(Clone)]
pub struct UpdateCallback {
    pub name: String,
    pub description: String,
    pub func: UpdateCallbackFn,
}

impl fmt::Debug for UpdateCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateCallback")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Table of callbacks per registrable kind.
#[derive(Debug)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<ObjectKind, Vec<UpdateCallback>>>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        let callbacks = ObjectKind::REGISTRABLE
            .into_iter()
            .map(|kind| (kind, Vec::new()))
            .collect();
        Self {
            callbacks: RwLock::new(callbacks),
        }
    }

    /// Register `func` under `kind`.
    ///
    /// # Errors
    ///
    /// - [`InformerError::IllegalCallbackKind`] if `kind` does not accept callbacks
    /// - [`InformerError::DuplicateCallback`] if `name` is already registered for `kind`
    ///
    /// Both indicate a wiring defect and should abort startup.
    pub fn register<F>(
        &self,
        kind: ObjectKind,
        name: impl Into<String>,
        description: impl Into<String>,
        func: F,
    ) -> Result<(), Report<InformerError>>
    where
        F: Fn(&dyn StatesReader) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut table = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(callbacks) = table.get_mut(&kind) else {
            return Err(Report::new(InformerError::IllegalCallbackKind { kind }));
        };
        if callbacks.iter().any(|c| c.name == name) {
            return Err(Report::new(InformerError::DuplicateCallback { kind, name }));
        }

        info!(kind = %kind, name = %name, "states informer callback has registered");
        callbacks.push(UpdateCallback {
            name,
            description: description.into(),
            func: Arc::new(func),
        });
        Ok(())
    }

    /// Snapshot of the callbacks registered for `kind`, in registration order.
    pub fn callbacks(&self, kind: ObjectKind) -> Vec<UpdateCallback> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}
