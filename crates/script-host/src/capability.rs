//! The capability adapter seam
//!
//! An adapter installs native functions into a session's globals and, when
//! it is asynchronous, owns a queue its producer threads feed. The session
//! drains every adapter queue during `pump` and asks the adapter which
//! callbacks an event should reach.

use std::rc::Rc;
use std::sync::Arc;

use mlua::{Function, IntoLua, Lua, RegistryKey};
use tether_engine_core::{AdapterLifecycle, EventQueue, HandleTable, RegistryError};
use tether_protocol::{Event, Handle, SessionId};

/// Script values the session holds on behalf of native code
pub type ValueRegistry = HandleTable<RegistryKey>;

/// A native capability exposed to scripts
pub trait Capability {
    fn name(&self) -> &'static str;

    /// Register this adapter's globals
    fn install(&self, lua: &Lua, ctx: &InstallContext) -> mlua::Result<()>;

    /// Queue drained by `pump`; synchronous adapters have none
    fn queue(&self) -> Option<&Arc<EventQueue>> {
        None
    }

    fn lifecycle(&self) -> &AdapterLifecycle;

    /// Callback handles an event is delivered to
    fn route(&self, event: &Event) -> Vec<Handle> {
        match event {
            Event::Message { source, .. } | Event::Error { source, .. } | Event::Fire { source } => {
                vec![*source]
            }
            Event::Close { .. } | Event::Tick => Vec::new(),
        }
    }

    /// Handles owned by a producer that just closed; the session releases
    /// them together with the source handle
    fn retire(&self, _source: Handle) -> Vec<Handle> {
        Vec::new()
    }

    /// Cancel and join producer threads
    fn shutdown(&self) {}
}

/// What adapters get when they install
#[derive(Clone)]
pub struct InstallContext {
    pub session: SessionId,
    pub callbacks: Callbacks,
}

/// Session-scoped access to the value registry for native functions
#[derive(Clone)]
pub struct Callbacks {
    registry: Rc<ValueRegistry>,
}

impl Callbacks {
    pub(crate) fn new(registry: Rc<ValueRegistry>) -> Self {
        Self { registry }
    }

    /// Keep `value` alive in the Lua registry and hand out a fresh handle
    pub fn register(&self, lua: &Lua, value: impl IntoLua) -> mlua::Result<Handle> {
        let key = lua.create_registry_value(value)?;
        self.registry
            .register(key)
            .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
    }

    pub fn function(&self, lua: &Lua, handle: Handle) -> Result<Function, RegistryError> {
        self.registry
            .with(handle, |key| lua.registry_value::<Function>(key).ok())?
            .ok_or(RegistryError::InvalidHandle(handle))
    }

    /// Drop the handle and the Lua reference behind it
    pub fn release(&self, lua: &Lua, handle: Handle) -> Result<(), RegistryError> {
        let key = self.registry.release(handle)?;
        if let Err(e) = lua.remove_registry_value(key) {
            tracing::debug!(%handle, error = %e, "Registry value already gone");
        }
        Ok(())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.registry.contains(handle)
    }

    pub(crate) fn table(&self) -> &ValueRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inline;

    impl Capability for Inline {
        fn name(&self) -> &'static str {
            "inline"
        }

        fn install(&self, _lua: &Lua, _ctx: &InstallContext) -> mlua::Result<()> {
            Ok(())
        }

        fn lifecycle(&self) -> &AdapterLifecycle {
            unreachable!("not used")
        }
    }

    #[test]
    fn default_routing() {
        let h = Handle::new(0, 1);
        let adapter = Inline;
        assert_eq!(adapter.route(&Event::message(h, b"x".to_vec())), vec![h]);
        assert_eq!(adapter.route(&Event::Fire { source: h }), vec![h]);
        assert!(adapter.route(&Event::Close { source: h }).is_empty());
        assert!(adapter.route(&Event::Tick).is_empty());
        assert!(adapter.retire(h).is_empty());
        assert!(adapter.queue().is_none());
    }

    #[test]
    fn callbacks_register_resolve_release() {
        let lua = Lua::new();
        let callbacks = Callbacks::new(Rc::new(ValueRegistry::new("test")));
        let f: Function = lua.load("return function(x) return x * 2 end").eval().unwrap();

        let h = callbacks.register(&lua, f).unwrap();
        let resolved = callbacks.function(&lua, h).unwrap();
        assert_eq!(resolved.call::<i64>(21).unwrap(), 42);

        callbacks.release(&lua, h).unwrap();
        assert!(!callbacks.contains(h));
        assert_eq!(
            callbacks.release(&lua, h),
            Err(RegistryError::AlreadyReleased(h))
        );
        assert!(callbacks.function(&lua, h).is_err());
    }

    #[test]
    fn non_function_values_do_not_resolve_as_callbacks() {
        let lua = Lua::new();
        let callbacks = Callbacks::new(Rc::new(ValueRegistry::new("test")));
        let h = callbacks.register(&lua, 5).unwrap();
        assert!(matches!(
            callbacks.function(&lua, h),
            Err(RegistryError::InvalidHandle(bad)) if bad == h
        ));
    }
}
