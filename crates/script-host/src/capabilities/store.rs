//! The `store` library: persistent key-value state
//!
//! The file is opened on first use and flushed when the session closes.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use mlua::{Lua, MultiValue, Value};
use tether_engine_core::{AdapterLifecycle, KvStore, StoreError};
use tether_protocol::ScriptValue;

use crate::bindings::{arg_string, nil_with, ok_or_nil, to_lua_value, to_script_value};
use crate::{Capability, InstallContext};

struct LazyStore {
    root: PathBuf,
    file: String,
    store: RefCell<Option<KvStore>>,
}

impl LazyStore {
    fn with<R>(&self, f: impl FnOnce(&mut KvStore) -> Result<R, StoreError>) -> Result<R, String> {
        let mut slot = self.store.borrow_mut();
        if slot.is_none() {
            *slot = Some(KvStore::open(&self.root, &self.file).map_err(|e| e.to_string())?);
        }
        match slot.as_mut() {
            Some(store) => f(store).map_err(|e| e.to_string()),
            None => Err("store unavailable".into()),
        }
    }
}

pub struct StoreLib {
    inner: Rc<LazyStore>,
    lifecycle: AdapterLifecycle,
}

impl StoreLib {
    pub fn new(workspace_root: PathBuf, file: String) -> Self {
        Self {
            inner: Rc::new(LazyStore {
                root: workspace_root,
                file,
                store: RefCell::new(None),
            }),
            lifecycle: AdapterLifecycle::new("store"),
        }
    }
}

impl Capability for StoreLib {
    fn name(&self) -> &'static str {
        "store"
    }

    fn install(&self, lua: &Lua, _ctx: &InstallContext) -> mlua::Result<()> {
        let store = lua.create_table()?;

        let inner = self.inner.clone();
        store.set(
            "get",
            lua.create_function(move |lua, key: Value| {
                let found = arg_string(&key, "key")
                    .and_then(|key| inner.with(|s| Ok(s.get(&key).cloned())));
                match found {
                    Ok(Some(value)) => Ok(MultiValue::from_vec(vec![to_lua_value(lua, &value)?])),
                    Ok(None) => Ok(MultiValue::from_vec(vec![Value::Nil])),
                    Err(e) => nil_with(lua, e),
                }
            })?,
        )?;

        let inner = self.inner.clone();
        store.set(
            "set",
            lua.create_function(move |lua, (key, value): (Value, Value)| {
                let result = arg_string(&key, "key").and_then(|key| {
                    inner.with(|s| match to_script_value(&value) {
                        ScriptValue::Nil => Ok(s.delete(&key)),
                        value => s.set(&key, value).map(|_| true),
                    })
                });
                ok_or_nil(lua, result.map(|_| true))
            })?,
        )?;

        let inner = self.inner.clone();
        store.set(
            "delete",
            lua.create_function(move |lua, key: Value| {
                let result =
                    arg_string(&key, "key").and_then(|key| inner.with(|s| Ok(s.delete(&key))));
                ok_or_nil(lua, result)
            })?,
        )?;

        let inner = self.inner.clone();
        store.set(
            "keys",
            lua.create_function(move |lua, ()| ok_or_nil(lua, inner.with(|s| Ok(s.keys()))))?,
        )?;

        let inner = self.inner.clone();
        store.set(
            "flush",
            lua.create_function(move |lua, ()| {
                ok_or_nil(lua, inner.with(|s| s.flush()).map(|()| true))
            })?,
        )?;

        lua.globals().set("store", store)?;
        self.lifecycle.activate();
        Ok(())
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.lifecycle
    }

    fn shutdown(&self) {
        if let Some(store) = self.inner.store.borrow_mut().as_mut() {
            if let Err(e) = store.flush() {
                tracing::warn!(path = %store.path().display(), error = %e, "Store flush on close failed");
            }
        }
    }
}
