//! Host binary. Loads a cartridge, wires up print-based stand-ins for the host devices
//! `duocore` expects (real windowing/audio-output/input-polling are out of scope here,
//! same as the pixel rasterizer and waveform decoder), and drives `Machine::run`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use duocore::{
    AudioDevice, Cartridge, Config, InputDevice, Key, Machine, NopExecutor, PixelProcessor,
    RunCollaborators, SampleResult, SampleSource, TouchPoint, VideoDevice, FRAME_HEIGHT, FRAME_WIDTH,
};
use duocore_apu::{Format, SharedRingBuffer};

/// Keyboard bindings (host-side): A=A, S=B, Q=X, W=Y, D=L, F=R, Backspace=Select,
/// Return=Start, arrows=D-pad, Space=fast-forward hold. Mouse on the bottom half drives
/// the touch pen. None of this is wired to a real window here; there is no window.
#[derive(Parser, Debug)]
#[command(name = "duocore", about = "Dual-CPU handheld-console simulation core")]
struct Args {
    /// Path to the cartridge image.
    rom: PathBuf,

    /// Main-CPU cycles to run before exiting. The real host loop has no such bound and
    /// instead runs until its window closes; this binary has no window.
    #[arg(long, default_value_t = 100_000_000)]
    cycles: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let cart = Cartridge::load(&args.rom).with_context(|| format!("loading cartridge {}", args.rom.display()))?;

    let mut machine = Machine::new(Config::default());
    machine.load_cartridge(&cart);
    machine.set_input_device(Box::new(StubInputDevice));
    machine.set_video_device(Box::new(PrintingVideoDevice::default()));
    machine.set_audio_device(Box::new(SilentAudioDevice::default()));

    let mut executor_main = NopExecutor;
    let mut executor_audio = NopExecutor;
    let mut pixel_main = SilentPixelProcessor;
    let mut pixel_audio = SilentPixelProcessor;
    let mut sample_source = SilentSampleSource;

    let mut collab = RunCollaborators {
        executor_main: &mut executor_main,
        executor_audio: &mut executor_audio,
        pixel_main: &mut pixel_main,
        pixel_audio: &mut pixel_audio,
        sample_source: &mut sample_source,
    };

    let summary = machine.run(args.cycles, &mut collab);
    tracing::info!(
        main_cycles_run = summary.main_cycles_run,
        frames_completed = summary.frames_completed,
        "run finished"
    );

    Ok(())
}

/// Never reports a key or a pen touch. There is no terminal/window event source wired up
/// in this binary to poll for the keyboard/mouse bindings described above.
struct StubInputDevice;

impl InputDevice for StubInputDevice {
    fn is_key_down(&self, _key: Key) -> bool {
        false
    }

    fn touch_point(&self) -> Option<TouchPoint> {
        None
    }
}

/// Logs a line every 60 completed frames instead of presenting them in a window.
#[derive(Default)]
struct PrintingVideoDevice {
    frames: u32,
}

impl VideoDevice for PrintingVideoDevice {
    fn draw(&mut self, _top_rgba: &[u8], _bottom_rgba: &[u8]) {
        self.frames += 1;
        if self.frames % 60 == 0 {
            tracing::info!(frames = self.frames, width = FRAME_WIDTH, height = FRAME_HEIGHT, "frame presented");
        }
    }
}

/// Accepts the ring buffer and logs the negotiated format, but never drains it; there is
/// no real-time audio output device behind this binary.
#[derive(Default)]
struct SilentAudioDevice;

impl AudioDevice for SilentAudioDevice {
    fn open(&mut self, _ring: SharedRingBuffer) {
        tracing::info!("audio device opened");
    }

    fn close(&mut self) {
        tracing::info!("audio device closed");
    }

    fn sample_rate(&self) -> u32 {
        32_768
    }

    fn block_size(&self) -> u32 {
        1024
    }
}

/// Renders nothing; every scanline comes back fully transparent black.
struct SilentPixelProcessor;

impl PixelProcessor for SilentPixelProcessor {
    fn render_scanline(&mut self, _vcount: u16, out_rgba_row: &mut [u8]) {
        out_rgba_row.fill(0);
    }
}

/// Every channel reports end-of-sample immediately; no waveform decoding happens here.
struct SilentSampleSource;

impl SampleSource for SilentSampleSource {
    fn next_sample(&mut self, _channel: usize, _src_address: u32, _format: Format) -> SampleResult {
        SampleResult::Finished
    }
}
