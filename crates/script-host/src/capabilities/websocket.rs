//! `WebSocket.connect(url)`
//!
//! Each connection is a userdata registered as the source handle of its
//! receiver thread. Callbacks subscribed with `OnMessage`, `OnClose` and
//! `OnError` are released together with the connection once its `Close`
//! event has been dispatched.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, MultiValue, UserData, UserDataFields, UserDataMethods, Value};
use tether_engine_core::net::WsConnection;
use tether_engine_core::{
    AdapterLifecycle, EventQueue, ProducerSet, QueueConfig, QueueProducer, JOIN_TIMEOUT,
};
use tether_policy::{validate_url, NetworkPolicy};
use tether_protocol::{Event, Handle};

use crate::bindings::{arg_bytes, arg_function, arg_string, nil_with, ok_or_nil};
use crate::{Callbacks, Capability, InstallContext};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Message,
    Close,
    Error,
}

struct Connection {
    socket: WsConnection,
    retired: Cell<bool>,
    on_message: RefCell<Vec<Handle>>,
    on_close: RefCell<Vec<Handle>>,
    on_error: RefCell<Vec<Handle>>,
}

impl Connection {
    fn slot(&self, slot: Slot) -> &RefCell<Vec<Handle>> {
        match slot {
            Slot::Message => &self.on_message,
            Slot::Close => &self.on_close,
            Slot::Error => &self.on_error,
        }
    }

    fn subscribers(&self, slot: Slot) -> Vec<Handle> {
        self.slot(slot).borrow().clone()
    }
}

/// The script-visible connection object
struct WsObject {
    connection: Rc<Connection>,
    callbacks: Callbacks,
}

impl WsObject {
    fn subscribe(&self, lua: &Lua, slot: Slot, callback: &Value) -> Result<(), String> {
        if self.connection.retired.get() {
            return Err("connection is closed".into());
        }
        let callback = arg_function(callback, "callback")?;
        let handle = self
            .callbacks
            .register(lua, callback)
            .map_err(|e| e.to_string())?;
        self.connection.slot(slot).borrow_mut().push(handle);
        Ok(())
    }
}

impl UserData for WsObject {
    fn add_fields<F: UserDataFields<Self>>(fields: &mut F) {
        fields.add_field_method_get("Url", |_, this| Ok(this.connection.socket.url().to_string()));
        fields.add_field_method_get("Connected", |_, this| Ok(this.connection.socket.is_open()));
    }

    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("Send", |lua, this, payload: Value| {
            let sent = arg_bytes(&payload, "payload").and_then(|payload| {
                this.connection
                    .socket
                    .send(&payload)
                    .map_err(|e| e.to_string())
            });
            ok_or_nil(lua, sent.map(|()| true))
        });

        methods.add_method("Close", |_, this, ()| {
            this.connection.socket.close();
            Ok(())
        });

        for (name, slot) in [
            ("OnMessage", Slot::Message),
            ("OnClose", Slot::Close),
            ("OnError", Slot::Error),
        ] {
            methods.add_method(name, move |lua, this, callback: Value| {
                ok_or_nil(lua, this.subscribe(lua, slot, &callback).map(|()| true))
            });
        }
    }
}

struct Inner {
    queue: Arc<EventQueue>,
    producers: ProducerSet,
    policy: NetworkPolicy,
    timeout: Duration,
    lifecycle: AdapterLifecycle,
    connections: RefCell<HashMap<Handle, Rc<Connection>>>,
}

impl Inner {
    fn connect(&self, lua: &Lua, callbacks: &Callbacks, url: &Value) -> mlua::Result<MultiValue> {
        if !self.lifecycle.accepts_work() {
            return nil_with(lua, "websocket adapter is shutting down");
        }
        let url = match arg_string(url, "url") {
            Ok(url) => url,
            Err(e) => return nil_with(lua, e),
        };
        if let Err(rejection) = validate_url(&url, &self.policy).into_result() {
            tracing::debug!(%url, %rejection, "WebSocket connect refused");
            return nil_with(lua, rejection);
        }
        let socket = match WsConnection::connect(&url, self.timeout) {
            Ok(socket) => socket,
            Err(e) => return nil_with(lua, e),
        };

        let connection = Rc::new(Connection {
            socket,
            retired: Cell::new(false),
            on_message: RefCell::new(Vec::new()),
            on_close: RefCell::new(Vec::new()),
            on_error: RefCell::new(Vec::new()),
        });
        let object = lua.create_userdata(WsObject {
            connection: connection.clone(),
            callbacks: callbacks.clone(),
        })?;
        let source = callbacks.register(lua, object.clone())?;

        let producer = QueueProducer::new(self.queue.clone(), source);
        if let Err(e) = connection.socket.start_receiver(&self.producers, producer) {
            connection.retired.set(true);
            connection.socket.close();
            if let Err(release) = callbacks.release(lua, source) {
                tracing::debug!(%source, error = %release, "Source already released");
            }
            return nil_with(lua, e);
        }
        self.connections.borrow_mut().insert(source, connection);
        self.lifecycle.activate();
        tracing::debug!(%url, %source, "WebSocket opened");

        Ok(MultiValue::from_vec(vec![Value::UserData(object)]))
    }
}

pub struct WebSocketLib {
    inner: Rc<Inner>,
}

impl WebSocketLib {
    pub fn new(queue: &QueueConfig, policy: NetworkPolicy, timeout: Duration) -> Self {
        Self {
            inner: Rc::new(Inner {
                queue: Arc::new(EventQueue::new("websocket", queue)),
                producers: ProducerSet::new("websocket"),
                policy,
                timeout,
                lifecycle: AdapterLifecycle::new("websocket"),
                connections: RefCell::new(HashMap::new()),
            }),
        }
    }
}

impl Capability for WebSocketLib {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn install(&self, lua: &Lua, ctx: &InstallContext) -> mlua::Result<()> {
        let websocket = lua.create_table()?;
        let (inner, callbacks) = (self.inner.clone(), ctx.callbacks.clone());
        websocket.set(
            "connect",
            lua.create_function(move |lua, url: Value| inner.connect(lua, &callbacks, &url))?,
        )?;
        lua.globals().set("WebSocket", websocket)?;
        Ok(())
    }

    fn queue(&self) -> Option<&Arc<EventQueue>> {
        Some(&self.inner.queue)
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.inner.lifecycle
    }

    fn route(&self, event: &Event) -> Vec<Handle> {
        let (source, slot) = match event {
            Event::Message { source, .. } => (source, Slot::Message),
            Event::Error { source, .. } => (source, Slot::Error),
            Event::Close { source } => (source, Slot::Close),
            Event::Fire { .. } | Event::Tick => return Vec::new(),
        };
        self.inner
            .connections
            .borrow()
            .get(source)
            .map(|c| c.subscribers(slot))
            .unwrap_or_default()
    }

    fn retire(&self, source: Handle) -> Vec<Handle> {
        let Some(connection) = self.inner.connections.borrow_mut().remove(&source) else {
            return Vec::new();
        };
        connection.retired.set(true);
        [Slot::Message, Slot::Close, Slot::Error]
            .into_iter()
            .flat_map(|slot| connection.slot(slot).take())
            .collect()
    }

    fn shutdown(&self) {
        let connections: Vec<_> = self.inner.connections.borrow_mut().drain().collect();
        for (_, connection) in &connections {
            connection.retired.set(true);
            connection.socket.close();
        }
        self.inner.producers.shutdown(JOIN_TIMEOUT);
        tracing::debug!(closed = connections.len(), "WebSockets shut down");
    }
}
