//! Host-facing trait boundary, per §6. The host owns concrete audio/input/video devices and
//! hands them to `Machine` through `set_audio_device` / `set_input_device` / `set_video_device`;
//! `Machine` stores them as trait objects and drives them from `run`.

use duocore_apu::SharedRingBuffer;

/// The 13 buttons and the hinge switch the host keyboard/controller maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    A,
    B,
    X,
    Y,
    L,
    R,
    Select,
    Start,
    Up,
    Down,
    Left,
    Right,
    Lid,
}

pub const KEY_COUNT: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchPoint {
    pub x: u16,
    pub y: u16,
}

/// Keypad/touch state, read directly by the simulation rather than through the MMIO
/// registry, per §5's "input state ... updated by the host thread" shared-resource policy.
/// Torn reads of independent bits are accepted as harmless; there is no lock.
pub trait InputDevice {
    fn is_key_down(&self, key: Key) -> bool;
    fn touch_point(&self) -> Option<TouchPoint>;
}

/// A device that never reports a key pressed or a pen down; the default until the host
/// calls `set_input_device`.
#[derive(Default)]
pub struct NullInputDevice;

impl InputDevice for NullInputDevice {
    fn is_key_down(&self, _key: Key) -> bool {
        false
    }

    fn touch_point(&self) -> Option<TouchPoint> {
        None
    }
}

/// Host audio sink, per §6. `open` is called once, handing over the shared ring buffer the
/// APU mixer snapshots into; the host's real-time audio thread drains it directly rather
/// than through a registered `(userdata, callback)` pair, which doesn't carry over
/// idiomatically into a trait object that already owns its own state. `sample_rate` /
/// `block_size` are queried back from the device after `open` so the core can log what
/// the host actually opened at.
pub trait AudioDevice {
    fn open(&mut self, ring: SharedRingBuffer);
    fn close(&mut self);
    fn sample_rate(&self) -> u32;
    fn block_size(&self) -> u32;
}

/// Host video sink, per §6. `draw` is called once per completed frame with 256x192 RGBA
/// pixels for each screen.
pub trait VideoDevice {
    fn draw(&mut self, top_rgba: &[u8], bottom_rgba: &[u8]);
}
