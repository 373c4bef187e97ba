//! The `Drawing` library and the render-object globals
//!
//! Objects live in a shared draw list the render thread snapshots once per
//! frame. The thread starts with the first object or frame callback; every
//! frame it pushes a `Tick`, which is routed to the `Drawing.onFrame`
//! callbacks. Property reads of removed objects give `nil`; invalid
//! assignments raise.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Lua, MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value};
use tether_engine_core::render::{
    spawn_render_loop, Color3, DrawList, DrawingKind, PropertyValue, RenderBackend, Vec2, FONTS,
};
use tether_engine_core::{AdapterLifecycle, EventQueue, ProducerSet, QueueConfig, JOIN_TIMEOUT};
use tether_protocol::{Event, Handle};

use crate::bindings::{arg_function, arg_string, nil_with, ok_or_nil};
use crate::{Callbacks, Capability, InstallContext};

/// Script-side reference to one drawing object
struct DrawingRef {
    id: u32,
    list: Arc<DrawList>,
}

impl DrawingRef {
    fn get(&self, lua: &Lua, property: &str) -> mlua::Result<Value> {
        match self.list.read(self.id, |object| object.get(property)) {
            Ok(Some(value)) => from_property(lua, value),
            Ok(None) | Err(_) => Ok(Value::Nil),
        }
    }

    fn set(&self, property: &str, value: &Value) -> Result<(), String> {
        let value = to_property(value)?;
        self.list
            .update(self.id, |object| object.set(property, value))
            .and_then(|result| result)
            .map_err(|e| e.to_string())
    }
}

impl UserData for DrawingRef {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        for name in ["Remove", "Destroy"] {
            methods.add_method(name, |_, this, ()| Ok(this.list.remove(this.id)));
        }

        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| this.get(lua, &key));

        methods.add_meta_method(
            MetaMethod::NewIndex,
            |_, this, (key, value): (String, Value)| {
                this.set(&key, &value).map_err(mlua::Error::RuntimeError)
            },
        );

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            let kind = this
                .list
                .read(this.id, |object| object.kind.name())
                .unwrap_or("Removed");
            Ok(format!("Drawing.{kind}#{}", this.id))
        });
    }
}

fn vector_table(lua: &Lua, v: Vec2) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("X", v.x)?;
    table.set("Y", v.y)?;
    Ok(table)
}

fn from_property(lua: &Lua, value: PropertyValue) -> mlua::Result<Value> {
    Ok(match value {
        PropertyValue::Bool(b) => Value::Boolean(b),
        PropertyValue::Number(n) => Value::Number(n),
        PropertyValue::Text(text) => Value::String(lua.create_string(&text)?),
        PropertyValue::Vector(v) => Value::Table(vector_table(lua, v)?),
        PropertyValue::Color(c) => {
            let table = lua.create_table()?;
            table.set("R", c.r)?;
            table.set("G", c.g)?;
            table.set("B", c.b)?;
            Value::Table(table)
        }
    })
}

fn to_property(value: &Value) -> Result<PropertyValue, String> {
    match value {
        Value::Nil => Ok(PropertyValue::Bool(false)),
        Value::Boolean(b) => Ok(PropertyValue::Bool(*b)),
        Value::Integer(i) => Ok(PropertyValue::Number(*i as f64)),
        Value::Number(n) => Ok(PropertyValue::Number(*n)),
        Value::String(s) => Ok(PropertyValue::Text(s.to_string_lossy().to_string())),
        Value::Table(table) => {
            let field = |key: &str| table.get::<Option<f64>>(key).ok().flatten();
            match (field("X"), field("Y"), field("R"), field("G"), field("B")) {
                (Some(x), Some(y), ..) => Ok(PropertyValue::Vector(Vec2::new(x as f32, y as f32))),
                (_, _, Some(r), Some(g), Some(b)) => Ok(PropertyValue::Color(Color3 {
                    r: r as f32,
                    g: g as f32,
                    b: b as f32,
                })),
                _ => Err("expected a vector {X, Y} or a color {R, G, B}".into()),
            }
        }
        other => Err(format!("cannot assign a {} to a drawing property", other.type_name())),
    }
}

/// The object behind a script value, if it is one
fn drawing_of(value: &Value) -> Option<(u32, Arc<DrawList>)> {
    let Value::UserData(ud) = value else {
        return None;
    };
    let drawing = ud.borrow::<DrawingRef>().ok()?;
    Some((drawing.id, drawing.list.clone()))
}

struct Inner {
    list: Arc<DrawList>,
    queue: Arc<EventQueue>,
    producers: ProducerSet,
    backend: RefCell<Option<Box<dyn RenderBackend>>>,
    hz: u32,
    frames: Arc<AtomicU64>,
    rendering: Cell<bool>,
    frame_callbacks: RefCell<Vec<Handle>>,
    lifecycle: AdapterLifecycle,
}

impl Inner {
    /// Start the render thread on first use
    fn ensure_rendering(&self) -> Result<(), String> {
        if !self.lifecycle.accepts_work() {
            return Err("drawing adapter is shutting down".into());
        }
        if self.rendering.get() {
            return Ok(());
        }
        let Some(backend) = self.backend.borrow_mut().take() else {
            return Err("render backend unavailable".into());
        };
        spawn_render_loop(
            &self.producers,
            self.list.clone(),
            backend,
            self.hz,
            self.queue.clone(),
            self.frames.clone(),
        )
        .map_err(|e| format!("cannot start render thread: {e}"))?;
        self.rendering.set(true);
        self.lifecycle.activate();
        tracing::debug!(hz = self.hz, "Render thread started");
        Ok(())
    }

    fn create(&self, lua: &Lua, kind: &Value) -> mlua::Result<MultiValue> {
        let kind = match arg_string(kind, "kind")
            .and_then(|name| DrawingKind::parse(&name).map_err(|e| e.to_string()))
        {
            Ok(kind) => kind,
            Err(e) => return nil_with(lua, e),
        };
        if let Err(e) = self.ensure_rendering() {
            return nil_with(lua, e);
        }
        let id = self.list.create(kind);
        let object = lua.create_userdata(DrawingRef {
            id,
            list: self.list.clone(),
        })?;
        Ok(MultiValue::from_vec(vec![Value::UserData(object)]))
    }

    fn on_frame(&self, lua: &Lua, callbacks: &Callbacks, callback: &Value) -> Result<i64, String> {
        let callback = arg_function(callback, "callback")?;
        self.ensure_rendering()?;
        let handle = callbacks.register(lua, callback).map_err(|e| e.to_string())?;
        self.frame_callbacks.borrow_mut().push(handle);
        Ok(handle.to_raw() as i64)
    }
}

pub struct DrawingLib {
    inner: Rc<Inner>,
    screen: Vec2,
}

impl DrawingLib {
    pub fn new(queue: &QueueConfig, screen: Vec2, hz: u32, backend: Box<dyn RenderBackend>) -> Self {
        Self {
            inner: Rc::new(Inner {
                list: Arc::new(DrawList::new(screen)),
                queue: Arc::new(EventQueue::new("drawing", queue)),
                producers: ProducerSet::new("drawing"),
                backend: RefCell::new(Some(backend)),
                hz,
                frames: Arc::new(AtomicU64::new(0)),
                rendering: Cell::new(false),
                frame_callbacks: RefCell::new(Vec::new()),
                lifecycle: AdapterLifecycle::new("drawing"),
            }),
            screen,
        }
    }

    /// Frames presented so far
    pub fn frames(&self) -> u64 {
        self.inner.frames.load(Ordering::Relaxed)
    }
}

impl Capability for DrawingLib {
    fn name(&self) -> &'static str {
        "drawing"
    }

    fn install(&self, lua: &Lua, ctx: &InstallContext) -> mlua::Result<()> {
        let drawing = lua.create_table()?;

        let inner = self.inner.clone();
        drawing.set(
            "new",
            lua.create_function(move |lua, kind: Value| inner.create(lua, &kind))?,
        )?;

        let inner = self.inner.clone();
        let clear = lua.create_function(move |_, ()| Ok(inner.list.clear()))?;
        drawing.set("clear", clear.clone())?;

        let (inner, callbacks) = (self.inner.clone(), ctx.callbacks.clone());
        drawing.set(
            "onFrame",
            lua.create_function(move |lua, callback: Value| {
                ok_or_nil(lua, inner.on_frame(lua, &callbacks, &callback))
            })?,
        )?;

        let fonts = lua.create_table()?;
        for (index, font) in FONTS.iter().enumerate() {
            fonts.set(*font, index)?;
        }
        drawing.set("Fonts", fonts)?;
        drawing.set("ScreenSize", vector_table(lua, self.screen)?)?;

        let globals = lua.globals();
        globals.set("Drawing", drawing)?;
        globals.set("cleardrawcache", clear)?;

        let inner = self.inner.clone();
        globals.set(
            "getscreensize",
            lua.create_function(move |lua, ()| vector_table(lua, inner.list.screen_size()))?,
        )?;

        globals.set(
            "isrenderobj",
            lua.create_function(|_, value: Value| {
                Ok(drawing_of(&value).is_some_and(|(id, list)| list.contains(id)))
            })?,
        )?;

        globals.set(
            "getrenderproperty",
            lua.create_function(|lua, (object, property): (Value, Value)| {
                let Some((id, list)) = drawing_of(&object) else {
                    return nil_with(lua, "not a drawing object");
                };
                let property = match arg_string(&property, "property") {
                    Ok(property) => property,
                    Err(e) => return nil_with(lua, e),
                };
                match list.read(id, |o| o.get(&property)) {
                    Ok(Some(value)) => Ok(MultiValue::from_vec(vec![from_property(lua, value)?])),
                    Ok(None) => nil_with(lua, format!("unknown property '{property}'")),
                    Err(e) => nil_with(lua, e),
                }
            })?,
        )?;

        globals.set(
            "setrenderproperty",
            lua.create_function(|lua, (object, property, value): (Value, Value, Value)| {
                let Value::UserData(object) = object else {
                    return nil_with(lua, "not a drawing object");
                };
                let result = object
                    .borrow::<DrawingRef>()
                    .map_err(|_| "not a drawing object".to_string())
                    .and_then(|drawing| {
                        let property = arg_string(&property, "property")?;
                        drawing.set(&property, &value)
                    });
                ok_or_nil(lua, result.map(|()| true))
            })?,
        )?;

        Ok(())
    }

    fn queue(&self) -> Option<&Arc<EventQueue>> {
        Some(&self.inner.queue)
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.inner.lifecycle
    }

    fn route(&self, event: &Event) -> Vec<Handle> {
        match event {
            Event::Tick => self.inner.frame_callbacks.borrow().clone(),
            _ => Vec::new(),
        }
    }

    fn shutdown(&self) {
        self.inner.producers.shutdown(JOIN_TIMEOUT);
        let removed = self.inner.list.clear();
        tracing::debug!(
            frames = self.frames(),
            removed,
            "Drawing shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{eval, pump_until, session_with};
    use std::sync::Mutex;
    use tether_engine_core::render::{Frame, NullBackend, DEFAULT_SCREEN_SIZE};

    struct Recording {
        frames: Arc<Mutex<Vec<usize>>>,
    }

    impl RenderBackend for Recording {
        fn present(&mut self, frame: &Frame) {
            self.frames.lock().unwrap().push(frame.objects.len());
        }

        fn screen_size(&self) -> Option<Vec2> {
            Some(Vec2::new(1280.0, 720.0))
        }
    }

    fn lib(backend: Box<dyn RenderBackend>) -> Box<DrawingLib> {
        Box::new(DrawingLib::new(
            &QueueConfig::default(),
            DEFAULT_SCREEN_SIZE,
            200,
            backend,
        ))
    }

    #[test]
    fn properties_read_back() {
        let session = session_with(lib(Box::new(NullBackend)));
        let (x, r, visible, text, z, kind): (f64, f64, bool, String, i64, String) = eval(
            &session,
            "local s = Drawing.new('Square') \
             s.Position = {X = 10, Y = 20} \
             s.Color = {R = 0.5, G = 0, B = 0} \
             s.Visible = false \
             s.ZIndex = 3 \
             local t = Drawing.new('Text') \
             t.Text = 'hi' \
             return s.Position.X, s.Color.R, s.Visible, t.Text, s.ZIndex, tostring(t)",
        );
        assert_eq!(x, 10.0);
        assert_eq!(r, 0.5);
        assert!(!visible);
        assert_eq!(text, "hi");
        assert_eq!(z, 3);
        assert!(kind.starts_with("Drawing.Text#"));
    }

    #[test]
    fn remove_and_render_object_checks() {
        let session = session_with(lib(Box::new(NullBackend)));
        let (before, after, gone, table_check): (bool, bool, Value, bool) = eval(
            &session,
            "local l = Drawing.new('Line') \
             local before = isrenderobj(l) \
             l:Remove() \
             return before, isrenderobj(l), l.Thickness, isrenderobj({})",
        );
        assert!(before);
        assert!(!after);
        assert!(gone.is_nil());
        assert!(!table_check);
    }

    #[test]
    fn invalid_input() {
        let session = session_with(lib(Box::new(NullBackend)));
        let (value, message): (Value, String) = eval(&session, "return Drawing.new('Hexagon')");
        assert!(value.is_nil());
        assert!(message.contains("Hexagon"));

        let (ok, err): (bool, String) = eval(
            &session,
            "local c = Drawing.new('Circle') \
             local ok, err = pcall(function() c.Radius = 'big' end) \
             return ok, tostring(err)",
        );
        assert!(!ok);
        assert!(err.contains("Radius"));

        let (value, message): (Value, String) = eval(
            &session,
            "return setrenderproperty(Drawing.new('Circle'), 'Nope', 1)",
        );
        assert!(value.is_nil());
        assert!(message.contains("Nope"));
    }

    #[test]
    fn render_property_globals() {
        let session = session_with(lib(Box::new(NullBackend)));
        let (set, radius, cleared, fonts): (bool, f64, i64, i64) = eval(
            &session,
            "local c = Drawing.new('Circle') \
             local ok = setrenderproperty(c, 'Radius', 12) \
             local r = getrenderproperty(c, 'Radius') \
             Drawing.new('Quad') \
             return ok, r, cleardrawcache(), Drawing.Fonts.Plex",
        );
        assert!(set);
        assert_eq!(radius, 12.0);
        assert_eq!(cleared, 2);
        assert_eq!(fonts, 4);
    }

    #[test]
    fn frames_reach_backend_and_callbacks() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let session = session_with(lib(Box::new(Recording {
            frames: frames.clone(),
        })));
        let _: i64 = eval(
            &session,
            "Drawing.new('Circle') \
             return Drawing.onFrame(function() ticks = (ticks or 0) + 1 end)",
        );

        assert!(pump_until(&session, |s| {
            s.lua().globals().get::<Option<i64>>("ticks").unwrap().unwrap_or(0) >= 3
        }));
        assert!(frames.lock().unwrap().iter().any(|&n| n == 1));

        let (x, y): (f64, f64) = eval(&session, "local s = getscreensize() return s.X, s.Y");
        assert_eq!((x, y), (1280.0, 720.0));

        session.close().unwrap();
        let seen = frames.lock().unwrap().len();
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(frames.lock().unwrap().len(), seen);
    }
}
