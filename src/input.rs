//! Normalized input intake and routing.
//!
//! Event decoding happens outside this crate; collaborators push already
//! normalized events tagged with a source id. Each source keeps its last
//! known pointer position and pressed state, which is all the content
//! producer may see while the panel is idle. Raw arrivals always count as
//! activity for the idle machine regardless of the routing mode.

use tracing::trace;

pub type SourceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pointer,
    Touch,
    Keypad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Motion { x: u32, y: u32 },
    Button { x: u32, y: u32, pressed: bool },
    Key { key: u32, pressed: bool },
    Encoder { delta: i16 },
}

impl InputEvent {
    fn is_release(self) -> bool {
        matches!(
            self,
            InputEvent::Button { pressed: false, .. } | InputEvent::Key { pressed: false, .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEvent {
    pub source: SourceId,
    pub event: InputEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Forward events to the producer.
    Normal,
    /// Swallow events; only the last known state remains visible.
    Idle,
    /// Swallow events until the waking touch is released, then return to
    /// Normal. Keeps the wake tap from activating whatever happens to be
    /// under the finger.
    WakeOnRelease,
}

#[derive(Debug)]
struct Source {
    kind: SourceKind,
    routing: Routing,
    x: u32,
    y: u32,
    pressed: bool,
}

#[derive(Debug, Default)]
pub struct Inputs {
    sources: Vec<Source>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, kind: SourceKind) -> SourceId {
        self.sources.push(Source {
            kind,
            routing: Routing::Normal,
            x: 0,
            y: 0,
            pressed: false,
        });
        self.sources.len() - 1
    }

    pub fn kind(&self, id: SourceId) -> Option<SourceKind> {
        self.sources.get(id).map(|s| s.kind)
    }

    /// Records the event into the source's state and decides whether it
    /// propagates to the producer.
    pub fn process(&mut self, ev: SourceEvent) -> Option<InputEvent> {
        let source = self.sources.get_mut(ev.source)?;

        match ev.event {
            InputEvent::Motion { x, y } => {
                source.x = x;
                source.y = y;
            }
            InputEvent::Button { x, y, pressed } => {
                source.x = x;
                source.y = y;
                source.pressed = pressed;
            }
            InputEvent::Key { pressed, .. } => source.pressed = pressed,
            InputEvent::Encoder { .. } => (),
        }

        match source.routing {
            Routing::Normal => Some(ev.event),
            Routing::Idle => {
                trace!("source {} idle, swallowing {:?}", ev.source, ev.event);
                None
            }
            Routing::WakeOnRelease => {
                if ev.event.is_release() {
                    source.routing = Routing::Normal;
                    trace!("source {} released, restoring propagation", ev.source);
                }
                None
            }
        }
    }

    pub fn route_all(&mut self, routing: Routing) {
        for source in &mut self.sources {
            source.routing = routing;
        }
    }

    /// Wake from a specific source: everything returns to normal except a
    /// waking touch surface, which stays swallowed until its release.
    pub fn wake_from(&mut self, waker: SourceId) {
        for (id, source) in self.sources.iter_mut().enumerate() {
            source.routing = if id == waker && source.kind == SourceKind::Touch {
                Routing::WakeOnRelease
            } else {
                Routing::Normal
            };
        }
    }

    /// Last known pointer position and pressed state of a source.
    pub fn snapshot(&self, id: SourceId) -> Option<(u32, u32, bool)> {
        self.sources.get(id).map(|s| (s.x, s.y, s.pressed))
    }
}
