//! The driver surface and its dispatch-loop wiring.
//!
//! `Kiosk` owns the output, the idle machine and the input routing, and
//! multiplexes everything over one calloop reactor: display completion
//! events, normalized input, remote commands and the idle timers. All
//! callbacks run on the loop thread; nothing here needs locking.

use std::time::Duration;

use anyhow::Context;
use calloop::channel::{self, Channel, Sender};
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use tracing::{debug, trace, warn};

use crate::backend::drm::{DrmOutput, Geometry, PowerError};
use crate::idle::{Effect, IdleMachine};
use crate::input::{InputEvent, Inputs, Routing, SourceEvent, SourceId, SourceKind};
use crate::remote::{RemoteCommand, Telemetry, TelemetryEvent};

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// The back buffer handed to the producer for one redraw.
pub struct Canvas<'a> {
    pub data: &'a mut [u8],
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    pub index: usize,
}

/// A dirty rectangle in pixel coordinates, both corners inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushArea {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl FlushArea {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x1: 0,
            y1: 0,
            x2: width.saturating_sub(1),
            y2: height.saturating_sub(1),
        }
    }
}

/// The content producer, normally the GUI toolkit binding.
pub trait FrameProducer {
    /// The previously flushed buffer is safe to draw into again.
    fn frame_ready(&mut self);

    /// Render pending content into `canvas`. Returning `None` means
    /// nothing changed and no frame is submitted.
    fn redraw(&mut self, canvas: Canvas<'_>) -> Option<FlushArea>;

    fn input_event(&mut self, source: SourceId, event: InputEvent);
}

pub struct Kiosk {
    output: DrmOutput,
    idle: IdleMachine,
    inputs: Inputs,
    producer: Box<dyn FrameProducer>,
    telemetry: Box<dyn Telemetry>,

    loop_handle: LoopHandle<'static, Kiosk>,
    idle_timer: Option<RegistrationToken>,
    /// Whether a flushed frame is waiting for its completion before the
    /// producer may reuse the buffer.
    awaiting_ready: bool,

    input_rx: Option<Channel<SourceEvent>>,
    input_tx: Sender<SourceEvent>,
    command_rx: Option<Channel<RemoteCommand>>,
    command_tx: Sender<RemoteCommand>,
    remote_source: SourceId,
}

impl Kiosk {
    /// Brings up the display and prepares the collaborator channels. The
    /// loop sources are registered separately by
    /// [`register_with_dispatch_loop`](Self::register_with_dispatch_loop).
    pub fn init(
        loop_handle: LoopHandle<'static, Kiosk>,
        idle_timeout: Duration,
        producer: Box<dyn FrameProducer>,
        telemetry: Box<dyn Telemetry>,
    ) -> anyhow::Result<Self> {
        let output = DrmOutput::open()?;

        let (input_tx, input_rx) = channel::channel();
        let (command_tx, command_rx) = channel::channel();

        let mut inputs = Inputs::new();
        let remote_source = inputs.add_source(SourceKind::Keypad);

        Ok(Self {
            output,
            idle: IdleMachine::new(idle_timeout),
            inputs,
            producer,
            telemetry,
            loop_handle,
            idle_timer: None,
            awaiting_ready: false,
            input_rx: Some(input_rx),
            input_tx,
            command_rx: Some(command_rx),
            command_tx,
            remote_source,
        })
    }

    /// Registers the device fd, the collaborator channels and the timers
    /// with the dispatch loop, and arms the idle ladder.
    pub fn register_with_dispatch_loop(&mut self, frame_stats: bool) -> anyhow::Result<()> {
        let fd = self
            .output
            .event_source_fd()
            .context("error duplicating the device fd")?;
        self.loop_handle
            .insert_source(
                Generic::new(fd, Interest::READ, Mode::Level),
                |_, _, kiosk: &mut Kiosk| {
                    kiosk.on_device_ready();
                    Ok(PostAction::Continue)
                },
            )
            .unwrap();

        let input_rx = self
            .input_rx
            .take()
            .context("already registered with a dispatch loop")?;
        self.loop_handle
            .insert_source(input_rx, |event, _, kiosk: &mut Kiosk| {
                if let channel::Event::Msg(ev) = event {
                    kiosk.on_input(ev);
                }
            })
            .unwrap();

        let command_rx = self
            .command_rx
            .take()
            .context("already registered with a dispatch loop")?;
        self.loop_handle
            .insert_source(command_rx, |event, _, kiosk: &mut Kiosk| {
                if let channel::Event::Msg(command) = event {
                    kiosk.on_command(command);
                }
            })
            .unwrap();

        if frame_stats {
            self.loop_handle
                .insert_source(
                    Timer::from_duration(STATS_INTERVAL),
                    |_, _, kiosk: &mut Kiosk| {
                        kiosk.report_stats();
                        TimeoutAction::ToDuration(STATS_INTERVAL)
                    },
                )
                .unwrap();
        }

        self.rearm_idle_timer();

        Ok(())
    }

    /// Registers an input source. The returned id tags events pushed
    /// through [`input_sender`](Self::input_sender).
    pub fn add_input_source(&mut self, kind: SourceKind) -> SourceId {
        self.inputs.add_source(kind)
    }

    pub fn input_sender(&self) -> Sender<SourceEvent> {
        self.input_tx.clone()
    }

    pub fn command_sender(&self) -> Sender<RemoteCommand> {
        self.command_tx.clone()
    }

    pub fn geometry(&self) -> Geometry {
        self.output.geometry()
    }

    pub fn buffer_ptr(&mut self, index: usize) -> *mut u8 {
        self.output.buffer_mut(index).as_mut_ptr()
    }

    pub fn buffer_len(&mut self, index: usize) -> usize {
        self.output.buffer_mut(index).len()
    }

    /// Presents `index`. Only the last area of a frame submits; partial
    /// flushes are acknowledged immediately.
    pub fn flush(&mut self, area: FlushArea, index: usize, last: bool) {
        trace!("flush buffer {index} {area:?} last {last}");

        if !last {
            self.producer.frame_ready();
            return;
        }

        // A previous frame still in flight is drained first so submissions
        // stay strictly ordered.
        if self.output.is_busy() {
            self.wait_for_vsync();
        }

        match self.output.submit(index) {
            Ok(true) => self.awaiting_ready = true,
            Ok(false) => self.producer.frame_ready(),
            Err(err) => {
                warn!("dropping frame: {err}");
                self.producer.frame_ready();
            }
        }
    }

    /// Blocks until the outstanding transaction completes; signals the
    /// producer ready either way.
    pub fn wait_for_vsync(&mut self) {
        match self.output.wait_for_vsync() {
            Ok(_) => (),
            Err(err) => warn!("error waiting for vsync: {err}"),
        }
        self.release_producer();
    }

    /// Renders immediately unless a transaction is outstanding; in that
    /// case the completion path triggers the redraw.
    pub fn refresh_now(&mut self) {
        if !self.output.is_busy() {
            self.trigger_redraw();
        }
    }

    pub fn set_power(&mut self, on: bool) -> Result<(), PowerError> {
        let result = self.output.set_power(on);
        match &result {
            Ok(()) => self.telemetry.publish(&TelemetryEvent::Power { on, supported: true }),
            Err(PowerError::Unsupported) => {
                debug!("power control unsupported, screen request only affects input routing");
                self.telemetry
                    .publish(&TelemetryEvent::Power { on, supported: false });
            }
            Err(err) => warn!("error setting power: {err}"),
        }
        result
    }

    pub fn shutdown(&mut self) {
        self.cancel_idle_timer();
        self.output.shutdown();
    }

    fn on_device_ready(&mut self) {
        match self.output.dispatch_events() {
            Ok(Some(index)) => {
                trace!("flip of buffer {index} complete");
                self.release_producer();
                self.trigger_redraw();
            }
            Ok(None) => (),
            Err(err) => warn!("error dispatching device events: {err}"),
        }
    }

    fn on_input(&mut self, ev: SourceEvent) {
        let touch = self.inputs.kind(ev.source) == Some(SourceKind::Touch);

        let effects = self.idle.on_activity(touch);
        self.apply_idle_effects(effects, Some(ev.source));

        if let Some(event) = self.inputs.process(ev) {
            self.producer.input_event(ev.source, event);
        }
    }

    fn on_command(&mut self, command: RemoteCommand) {
        debug!("remote command {command:?}");

        match command {
            RemoteCommand::Screen(cmd) => {
                let effects = self.idle.on_command(cmd);
                self.apply_idle_effects(effects, None);
            }
            RemoteCommand::Key { key } => {
                let source = self.remote_source;
                self.on_input(SourceEvent {
                    source,
                    event: InputEvent::Key { key, pressed: true },
                });
                self.on_input(SourceEvent {
                    source,
                    event: InputEvent::Key {
                        key,
                        pressed: false,
                    },
                });
            }
            RemoteCommand::Encoder { delta } => {
                let source = self.remote_source;
                self.on_input(SourceEvent {
                    source,
                    event: InputEvent::Encoder { delta },
                });
            }
        }
    }

    fn apply_idle_effects(&mut self, effects: Vec<Effect>, waker: Option<SourceId>) {
        for effect in effects {
            match effect {
                Effect::Announce(state) => {
                    debug!("idle state is now {state:?}");
                    self.telemetry.publish(&TelemetryEvent::IdleState { state });
                }
                Effect::PowerOn => {
                    let _ = self.set_power(true);
                }
                Effect::PowerOff => {
                    let _ = self.set_power(false);
                }
                Effect::RouteAllIdle => self.inputs.route_all(Routing::Idle),
                Effect::RouteAllNormal => self.inputs.route_all(Routing::Normal),
                Effect::RouteWakerOnRelease => match waker {
                    Some(id) => self.inputs.wake_from(id),
                    None => self.inputs.route_all(Routing::Normal),
                },
                Effect::RearmTimer => self.rearm_idle_timer(),
                Effect::CancelTimer => self.cancel_idle_timer(),
            }
        }
    }

    fn rearm_idle_timer(&mut self) {
        self.cancel_idle_timer();

        let timer = Timer::from_duration(self.idle.tick_interval());
        let token = self
            .loop_handle
            .insert_source(timer, |_, _, kiosk: &mut Kiosk| {
                kiosk.idle_timer = None;
                let effects = kiosk.idle.on_tick();
                kiosk.apply_idle_effects(effects, None);
                TimeoutAction::Drop
            })
            .unwrap();
        self.idle_timer = Some(token);
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(token) = self.idle_timer.take() {
            self.loop_handle.remove(token);
        }
    }

    fn release_producer(&mut self) {
        if self.awaiting_ready {
            self.awaiting_ready = false;
            self.producer.frame_ready();
        }
    }

    fn trigger_redraw(&mut self) {
        let geometry = self.output.geometry();
        let index = self.output.back_buffer();

        let dirty = {
            let data = self.output.buffer_mut(index);
            self.producer.redraw(Canvas {
                data,
                stride: geometry.stride,
                width: geometry.width,
                height: geometry.height,
                index,
            })
        };

        if let Some(area) = dirty {
            self.flush(area, index, true);
        }
    }

    fn report_stats(&mut self) {
        let stats = self.output.take_stats();
        if stats.blocking_waits == 0 && stats.completions == 0 {
            return;
        }

        trace!(
            "waits {} completions {}",
            stats.blocking_waits,
            stats.completions,
        );
        self.telemetry.publish(&TelemetryEvent::FrameStats {
            blocking_waits: stats.blocking_waits,
            completions: stats.completions,
        });
    }
}
