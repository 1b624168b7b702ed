use std::time::Duration;

use anyhow::Context;
use calloop::signals::{Signal, Signals};
use calloop::EventLoop;
use clap::Parser;
use tracing::{debug, info};

use glimt::input::{InputEvent, SourceId};
use glimt::remote::LogTelemetry;
use glimt::state::{Canvas, FlushArea, FrameProducer, Kiosk};

#[derive(Parser)]
#[command(version, about = "A DRM/KMS display daemon for always-on kiosk panels")]
struct Cli {
    /// Seconds of inactivity before the panel blanks.
    #[arg(long, default_value_t = 300)]
    idle_timeout: u64,

    /// Report per-second presentation statistics.
    #[arg(long)]
    frame_stats: bool,
}

/// Stand-in content while no toolkit binding is attached: a scrolling
/// gradient that exercises the full present path at refresh rate.
#[derive(Default)]
struct TestCard {
    frame: u64,
}

impl FrameProducer for TestCard {
    fn frame_ready(&mut self) {}

    fn redraw(&mut self, mut canvas: Canvas<'_>) -> Option<FlushArea> {
        let shift = self.frame as u32;
        self.frame += 1;

        for y in 0..canvas.height {
            let row = (y * canvas.stride) as usize;
            for x in 0..canvas.width {
                let offset = row + x as usize * 4;
                canvas.data[offset] = ((x ^ y) & 0xff) as u8;
                canvas.data[offset + 1] = ((y + shift) & 0xff) as u8;
                canvas.data[offset + 2] = ((x + shift) & 0xff) as u8;
                canvas.data[offset + 3] = 0;
            }
        }

        Some(FlushArea::full(canvas.width, canvas.height))
    }

    fn input_event(&mut self, source: SourceId, event: InputEvent) {
        debug!("input from source {source}: {event:?}");
    }
}

fn main() -> anyhow::Result<()> {
    match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(env_filter) => {
            tracing_subscriber::fmt()
                .compact()
                .with_env_filter(env_filter)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().compact().init();
        }
    }

    let cli = Cli::parse();

    let mut event_loop: EventLoop<'static, Kiosk> =
        EventLoop::try_new().context("error creating the event loop")?;
    let signal = event_loop.get_signal();

    let mut kiosk = Kiosk::init(
        event_loop.handle(),
        Duration::from_secs(cli.idle_timeout),
        Box::new(TestCard::default()),
        Box::new(LogTelemetry),
    )?;
    kiosk.register_with_dispatch_loop(cli.frame_stats)?;

    let geometry = kiosk.geometry();
    info!(
        "presenting at {}x{}, stride {}, dpi {:?}",
        geometry.width, geometry.height, geometry.stride, geometry.dpi,
    );

    event_loop
        .handle()
        .insert_source(
            Signals::new(&[Signal::SIGINT, Signal::SIGTERM])
                .context("error setting up signal handling")?,
            move |_, _, _| signal.stop(),
        )
        .unwrap();

    kiosk.refresh_now();

    event_loop
        .run(None, &mut kiosk, |_| {})
        .context("error running the event loop")?;

    kiosk.shutdown();
    Ok(())
}
