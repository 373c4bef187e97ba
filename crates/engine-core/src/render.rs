//! Drawing objects, the shared draw list and the fixed-rate render thread
//!
//! Scripts mutate objects in the draw list from the session thread. The
//! render thread snapshots the list once per frame, hands the snapshot to a
//! `RenderBackend` and pushes `Tick` so frame callbacks run on the next pump.
//! What a backend does with a frame is up to the host.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether_policy::CancellationToken;
use tether_protocol::Event;

use crate::adapter::{sleep_cancellable, ProducerSet};
use crate::sync::MutexExt;
use crate::transport::EventQueue;

/// Font names, indexed by the `Font` property
pub const FONTS: [&str; 5] = ["UI", "System", "RobotoMono", "Legacy", "Plex"];

/// Screen size reported before a backend says otherwise
pub const DEFAULT_SCREEN_SIZE: Vec2 = Vec2 { x: 844.0, y: 390.0 };

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Invalid drawing type: {0}")]
    UnknownKind(String),
    #[error("Unknown property '{0}'")]
    UnknownProperty(String),
    #[error("Property '{property}' expects {expected}")]
    WrongType {
        property: String,
        expected: &'static str,
    },
    #[error("Drawing object {0} was removed")]
    Removed(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrawingKind {
    Line,
    Circle,
    Square,
    Text,
    Triangle,
    Quad,
    Image,
}

impl DrawingKind {
    pub fn parse(name: &str) -> Result<Self, RenderError> {
        match name {
            "Line" => Ok(Self::Line),
            "Circle" => Ok(Self::Circle),
            "Square" => Ok(Self::Square),
            "Text" => Ok(Self::Text),
            "Triangle" => Ok(Self::Triangle),
            "Quad" => Ok(Self::Quad),
            "Image" => Ok(Self::Image),
            other => Err(RenderError::UnknownKind(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Line => "Line",
            Self::Circle => "Circle",
            Self::Square => "Square",
            Self::Text => "Text",
            Self::Triangle => "Triangle",
            Self::Quad => "Quad",
            Self::Image => "Image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// RGB color with components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color3 {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Default for Color3 {
    fn default() -> Self {
        Self {
            r: 1.0,
            g: 1.0,
            b: 1.0,
        }
    }
}

/// A property value crossing the script boundary
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Vector(Vec2),
    Color(Color3),
}

impl PropertyValue {
    fn as_bool(&self) -> bool {
        // Script truthiness: only false is false here; nil never arrives
        !matches!(self, Self::Bool(false))
    }

    fn as_number(&self, property: &str) -> Result<f64, RenderError> {
        match self {
            Self::Number(n) => Ok(*n),
            _ => Err(wrong_type(property, "a number")),
        }
    }

    fn as_vector(&self, property: &str) -> Result<Vec2, RenderError> {
        match self {
            Self::Vector(v) => Ok(*v),
            _ => Err(wrong_type(property, "a vector {X, Y}")),
        }
    }

    fn as_color(&self, property: &str) -> Result<Color3, RenderError> {
        match self {
            Self::Color(c) => Ok(*c),
            _ => Err(wrong_type(property, "a color {R, G, B}")),
        }
    }

    fn into_text(self, property: &str) -> Result<String, RenderError> {
        match self {
            Self::Text(s) => Ok(s),
            Self::Number(n) => Ok(n.to_string()),
            _ => Err(wrong_type(property, "a string")),
        }
    }
}

fn wrong_type(property: &str, expected: &'static str) -> RenderError {
    RenderError::WrongType {
        property: property.to_string(),
        expected,
    }
}

/// One drawing object. Every kind carries every property; the backend
/// reads the ones that apply to `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingObject {
    pub id: u32,
    pub kind: DrawingKind,
    pub visible: bool,
    pub transparency: f32,
    pub color: Color3,
    pub zindex: i32,
    pub from: Vec2,
    pub to: Vec2,
    pub position: Vec2,
    pub radius: f32,
    pub size: Vec2,
    pub text: String,
    pub text_size: f32,
    pub center: bool,
    pub outline: bool,
    pub outline_color: Color3,
    pub filled: bool,
    pub thickness: f32,
    pub point_a: Vec2,
    pub point_b: Vec2,
    pub point_c: Vec2,
    pub point_d: Vec2,
    pub data: String,
    pub rounding: f32,
    pub font: u32,
}

impl DrawingObject {
    pub fn new(id: u32, kind: DrawingKind) -> Self {
        Self {
            id,
            kind,
            visible: true,
            transparency: 0.0,
            color: Color3::default(),
            zindex: 0,
            from: Vec2::default(),
            to: Vec2::default(),
            position: Vec2::default(),
            radius: 0.0,
            size: Vec2::default(),
            text: String::new(),
            text_size: 16.0,
            center: false,
            outline: false,
            outline_color: Color3::default(),
            filled: false,
            thickness: 1.0,
            point_a: Vec2::default(),
            point_b: Vec2::default(),
            point_c: Vec2::default(),
            point_d: Vec2::default(),
            data: String::new(),
            rounding: 0.0,
            font: 0,
        }
    }

    /// Approximate extent of `text` at `text_size`
    pub fn text_bounds(&self) -> Vec2 {
        let chars = self.text.chars().count() as f32;
        Vec2::new(chars * self.text_size * 0.6, self.text_size)
    }

    pub fn get(&self, property: &str) -> Option<PropertyValue> {
        use PropertyValue as P;
        Some(match property {
            "Visible" => P::Bool(self.visible),
            "Color" => P::Color(self.color),
            "Transparency" => P::Number(f64::from(self.transparency)),
            "ZIndex" => P::Number(f64::from(self.zindex)),
            "From" => P::Vector(self.from),
            "To" => P::Vector(self.to),
            "Position" => P::Vector(self.position),
            "Radius" => P::Number(f64::from(self.radius)),
            // Text objects size by font size, everything else by extent
            "Size" if self.kind == DrawingKind::Text => P::Number(f64::from(self.text_size)),
            "Size" => P::Vector(self.size),
            "Text" => P::Text(self.text.clone()),
            "TextBounds" => P::Vector(self.text_bounds()),
            "TextSize" => P::Number(f64::from(self.text_size)),
            "Center" => P::Bool(self.center),
            "Outline" => P::Bool(self.outline),
            "OutlineColor" => P::Color(self.outline_color),
            "Filled" => P::Bool(self.filled),
            "Thickness" => P::Number(f64::from(self.thickness)),
            "PointA" => P::Vector(self.point_a),
            "PointB" => P::Vector(self.point_b),
            "PointC" => P::Vector(self.point_c),
            "PointD" => P::Vector(self.point_d),
            "Data" => P::Text(self.data.clone()),
            "Rounding" => P::Number(f64::from(self.rounding)),
            "Font" => P::Number(f64::from(self.font)),
            _ => return None,
        })
    }

    pub fn set(&mut self, property: &str, value: PropertyValue) -> Result<(), RenderError> {
        let p = property;
        match p {
            "Visible" => self.visible = value.as_bool(),
            "Color" => self.color = value.as_color(p)?,
            "Transparency" => self.transparency = value.as_number(p)?.clamp(0.0, 1.0) as f32,
            "ZIndex" => self.zindex = value.as_number(p)? as i32,
            "From" => self.from = value.as_vector(p)?,
            "To" => self.to = value.as_vector(p)?,
            "Position" => self.position = value.as_vector(p)?,
            "Radius" => self.radius = value.as_number(p)? as f32,
            "Size" => match value {
                PropertyValue::Vector(v) => self.size = v,
                PropertyValue::Number(n) => self.text_size = n as f32,
                _ => return Err(wrong_type(p, "a vector or a number")),
            },
            "Text" => self.text = value.into_text(p)?,
            "TextSize" => self.text_size = value.as_number(p)? as f32,
            "Center" => self.center = value.as_bool(),
            "Outline" => self.outline = value.as_bool(),
            "OutlineColor" => self.outline_color = value.as_color(p)?,
            "Filled" => self.filled = value.as_bool(),
            "Thickness" => self.thickness = value.as_number(p)? as f32,
            "PointA" => self.point_a = value.as_vector(p)?,
            "PointB" => self.point_b = value.as_vector(p)?,
            "PointC" => self.point_c = value.as_vector(p)?,
            "PointD" => self.point_d = value.as_vector(p)?,
            "Data" => self.data = value.into_text(p)?,
            "Rounding" => self.rounding = value.as_number(p)? as f32,
            "Font" => {
                let index = value.as_number(p)?;
                if index >= 0.0 && (index as usize) < FONTS.len() {
                    self.font = index as u32;
                }
            }
            "TextBounds" => return Err(wrong_type(p, "no assignment (read-only)")),
            _ => return Err(RenderError::UnknownProperty(p.to_string())),
        }
        Ok(())
    }
}

/// A snapshot handed to the backend once per frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub number: u64,
    /// Visible objects in paint order (z-index, then creation order)
    pub objects: Vec<DrawingObject>,
}

/// Where frames go. Implemented by the host.
pub trait RenderBackend: Send {
    fn present(&mut self, frame: &Frame);

    /// Current screen size, if the backend knows it
    fn screen_size(&self) -> Option<Vec2> {
        None
    }
}

/// Backend that discards frames
pub struct NullBackend;

impl RenderBackend for NullBackend {
    fn present(&mut self, _frame: &Frame) {}
}

/// Drawing objects of one session
pub struct DrawList {
    objects: Mutex<BTreeMap<u32, DrawingObject>>,
    next_id: AtomicU32,
    screen: Mutex<Vec2>,
}

impl DrawList {
    pub fn new(screen: Vec2) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
            screen: Mutex::new(screen),
        }
    }

    pub fn create(&self, kind: DrawingKind) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.objects
            .lock_or_recover()
            .insert(id, DrawingObject::new(id, kind));
        id
    }

    pub fn read<R>(&self, id: u32, f: impl FnOnce(&DrawingObject) -> R) -> Result<R, RenderError> {
        self.objects
            .lock_or_recover()
            .get(&id)
            .map(f)
            .ok_or(RenderError::Removed(id))
    }

    pub fn update<R>(
        &self,
        id: u32,
        f: impl FnOnce(&mut DrawingObject) -> R,
    ) -> Result<R, RenderError> {
        self.objects
            .lock_or_recover()
            .get_mut(&id)
            .map(f)
            .ok_or(RenderError::Removed(id))
    }

    pub fn remove(&self, id: u32) -> bool {
        self.objects.lock_or_recover().remove(&id).is_some()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.objects.lock_or_recover().contains_key(&id)
    }

    /// Remove every object; returns how many there were
    pub fn clear(&self) -> usize {
        let mut objects = self.objects.lock_or_recover();
        let count = objects.len();
        objects.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.objects.lock_or_recover().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DrawingObject> {
        let mut visible: Vec<DrawingObject> = self
            .objects
            .lock_or_recover()
            .values()
            .filter(|o| o.visible)
            .cloned()
            .collect();
        visible.sort_by_key(|o| (o.zindex, o.id));
        visible
    }

    pub fn screen_size(&self) -> Vec2 {
        *self.screen.lock_or_recover()
    }

    pub fn set_screen_size(&self, size: Vec2) {
        *self.screen.lock_or_recover() = size;
    }
}

/// Start the render thread at `hz` frames per second
pub fn spawn_render_loop(
    producers: &ProducerSet,
    draw_list: Arc<DrawList>,
    mut backend: Box<dyn RenderBackend>,
    hz: u32,
    queue: Arc<EventQueue>,
    frames: Arc<AtomicU64>,
) -> std::io::Result<CancellationToken> {
    let interval = Duration::from_secs(1) / hz.clamp(1, 1000);
    producers.spawn("render", move |token| {
        tracing::debug!(?interval, "Render loop started");
        while !token.is_cancelled() {
            let start = Instant::now();

            let number = frames.fetch_add(1, Ordering::Relaxed) + 1;
            let frame = Frame {
                number,
                objects: draw_list.snapshot(),
            };
            backend.present(&frame);
            if let Some(size) = backend.screen_size() {
                draw_list.set_screen_size(size);
            }

            // A session that is not pumping simply misses ticks
            if let Err(e) = queue.try_push(Event::Tick) {
                tracing::trace!(error = %e, frame = number, "Tick dropped");
            }

            let elapsed = start.elapsed();
            if elapsed < interval && !sleep_cancellable(&token, interval - elapsed) {
                break;
            }
        }
        tracing::debug!("Render loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::JOIN_TIMEOUT;

    struct Recording {
        frames: Arc<Mutex<Vec<usize>>>,
    }

    impl RenderBackend for Recording {
        fn present(&mut self, frame: &Frame) {
            self.frames.lock().unwrap().push(frame.objects.len());
        }

        fn screen_size(&self) -> Option<Vec2> {
            Some(Vec2::new(1920.0, 1080.0))
        }
    }

    #[test]
    fn kinds_parse() {
        assert_eq!(DrawingKind::parse("Quad").unwrap(), DrawingKind::Quad);
        assert_eq!(
            DrawingKind::parse("Hexagon"),
            Err(RenderError::UnknownKind("Hexagon".into()))
        );
    }

    #[test]
    fn properties_round_trip() {
        let mut obj = DrawingObject::new(1, DrawingKind::Square);
        obj.set("Position", PropertyValue::Vector(Vec2::new(10.0, 20.0)))
            .unwrap();
        obj.set("Filled", PropertyValue::Bool(true)).unwrap();
        obj.set("Transparency", PropertyValue::Number(2.0)).unwrap();
        assert_eq!(
            obj.get("Position"),
            Some(PropertyValue::Vector(Vec2::new(10.0, 20.0)))
        );
        assert_eq!(obj.get("Filled"), Some(PropertyValue::Bool(true)));
        assert_eq!(obj.get("Transparency"), Some(PropertyValue::Number(1.0)));
        assert_eq!(obj.get("Nope"), None);
        assert!(matches!(
            obj.set("Radius", PropertyValue::Text("x".into())),
            Err(RenderError::WrongType { .. })
        ));
        assert!(matches!(
            obj.set("Bogus", PropertyValue::Bool(true)),
            Err(RenderError::UnknownProperty(_))
        ));
    }

    #[test]
    fn text_size_and_bounds() {
        let mut obj = DrawingObject::new(1, DrawingKind::Text);
        obj.set("Text", PropertyValue::Text("hello".into())).unwrap();
        obj.set("Size", PropertyValue::Number(10.0)).unwrap();
        assert_eq!(obj.get("Size"), Some(PropertyValue::Number(10.0)));
        let bounds = obj.text_bounds();
        assert!((bounds.x - 30.0).abs() < 1e-3, "{bounds:?}");
        assert!((bounds.y - 10.0).abs() < 1e-3, "{bounds:?}");
    }

    #[test]
    fn snapshot_orders_by_zindex() {
        let list = DrawList::new(DEFAULT_SCREEN_SIZE);
        let a = list.create(DrawingKind::Line);
        let b = list.create(DrawingKind::Circle);
        let hidden = list.create(DrawingKind::Text);
        list.update(a, |o| o.zindex = 5).unwrap();
        list.update(hidden, |o| o.visible = false).unwrap();

        let ids: Vec<u32> = list.snapshot().iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![b, a]);

        assert!(list.remove(b));
        assert!(!list.remove(b));
        assert_eq!(list.read(b, |o| o.id), Err(RenderError::Removed(b)));
        assert_eq!(list.clear(), 2);
    }

    #[test]
    fn render_loop_presents_and_ticks() {
        let producers = ProducerSet::new("drawing");
        let list = Arc::new(DrawList::new(DEFAULT_SCREEN_SIZE));
        list.create(DrawingKind::Square);
        let queue = Arc::new(EventQueue::with_capacity("drawing", 8));
        let presented = Arc::new(Mutex::new(Vec::new()));
        let frames = Arc::new(AtomicU64::new(0));

        spawn_render_loop(
            &producers,
            list.clone(),
            Box::new(Recording {
                frames: presented.clone(),
            }),
            200,
            queue.clone(),
            frames.clone(),
        )
        .unwrap();

        assert!(queue.wait(Duration::from_secs(2)));
        assert_eq!(queue.pop(), Some(Event::Tick));
        producers.shutdown(JOIN_TIMEOUT);

        assert!(frames.load(Ordering::Relaxed) >= 1);
        assert_eq!(presented.lock().unwrap()[0], 1);
        assert_eq!(list.screen_size(), Vec2::new(1920.0, 1080.0));
    }
}
