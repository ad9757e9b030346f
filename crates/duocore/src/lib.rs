//! Top-level driver: a dual-CPU handheld-console simulation core built from the
//! scheduler, memory fabric, interrupt controllers, timers, IPC unit, DMA engines,
//! display timing unit, coprocessor, APU mixer, SPI bus, and cartridge loader crates.
//! `Machine` is the dependency-injection root that owns and wires all of them together.

pub mod config;
pub mod devices;
pub mod fetch;
mod machine;

pub use config::Config;
pub use devices::{AudioDevice, InputDevice, Key, NullInputDevice, TouchPoint, VideoDevice, KEY_COUNT};
pub use fetch::{AudioFetch, MainFetch};
pub use machine::{Machine, NopExecutor, RunCollaborators, RunSummary};

// Re-exported so callers can build collaborators (pixel processors, sample sources,
// cartridges) against the same types `Machine` itself uses without depending on every
// hardware crate directly.
pub use duocore_apu::{Format as ApuFormat, SampleResult, SampleSource};
pub use duocore_cart::{CartError, Cartridge, SaveBackup};
pub use duocore_cpu::{InstructionExecutor, StepOutcome};
pub use duocore_display::{DisplayTick, PixelProcessor, FRAME_HEIGHT, FRAME_WIDTH};
