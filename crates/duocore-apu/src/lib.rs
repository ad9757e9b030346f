//! Audio mixer (APU), per §4.11. 16 channels, each driven by its own scheduler event
//! whose period comes from the channel's timer-duty register; a second periodic event
//! snapshots the running stereo accumulator into a ring buffer the host audio thread
//! drains under a shared mutex. Waveform decoding (PCM8/PCM16/ADPCM/PSG) reads guest
//! memory and is out of scope here; `SampleSource` is the seam a host-side decoder
//! plugs into, mirroring how `PixelProcessor` stands in for the rasterizer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use duocore_mem::MmioRegister;
use duocore_scheduler::Scheduler;

pub const CHANNEL_COUNT: usize = 16;
/// Cycles between ring-buffer snapshots. Not tied to a specific host sample rate; the
/// host resamples whatever rate this implies against its own output device.
pub const MIXER_PERIOD_CYCLES: u64 = 1024;
pub const RING_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Pcm8,
    Pcm16,
    Adpcm,
    Psg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    Manual,
    Infinite,
    OneShot,
    Prohibited,
}

/// Produces the next mono sample for a channel in `[-1.0, 1.0]`. Implementations own
/// their own playback cursor (keyed by `channel`); `Finished` signals end-of-sample so
/// the mixer can apply `RepeatMode` without itself knowing the wire format.
pub trait SampleSource {
    fn next_sample(&mut self, channel: usize, src_address: u32, format: Format) -> SampleResult;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleResult {
    Value(f32),
    Finished,
}

#[derive(Debug, Clone, Copy, Default)]
struct Channel {
    volume_mul: u8, // 0..=127
    volume_div: u8, // 0..=3
    hold: bool,
    panning: u8, // 0..=127, 0 = full left, 127 = full right
    psg_wave_duty: u8,
    repeat_mode: RepeatMode,
    format: Format,
    running: bool,
    src_address: u32,
    timer_duty: u16,
    loop_start: u16,
    length: u32,
}

impl Channel {
    fn gain(&self) -> f32 {
        (self.volume_mul as f32 / 127.0) / (1 << self.volume_div) as f32
    }

    fn pan_gains(&self) -> (f32, f32) {
        let right = self.panning as f32 / 127.0;
        (1.0 - right, right)
    }

    fn period_cycles(&self) -> u64 {
        (0x1_0000 - self.timer_duty as u32) as u64
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Channel(u8),
    MixerSnapshot,
}

pub type SharedRingBuffer = Arc<Mutex<VecDeque<(i16, i16)>>>;

pub struct Apu {
    channels: [Channel; CHANNEL_COUNT],
    scheduler: Scheduler<Event>,
    accumulator: (f32, f32),
    ring: SharedRingBuffer,
}

impl Apu {
    pub fn new() -> Self {
        let mut scheduler = Scheduler::new();
        scheduler
            .add(MIXER_PERIOD_CYCLES, Event::MixerSnapshot)
            .expect("fresh scheduler has room for the mixer snapshot event");
        Self {
            channels: [Channel::default(); CHANNEL_COUNT],
            scheduler,
            accumulator: (0.0, 0.0),
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
        }
    }

    /// A clone of the shared ring buffer handle for the host audio thread to hold
    /// independently; the simulation thread never blocks on anything but a brief lock
    /// around pushing/draining this same buffer.
    pub fn ring(&self) -> SharedRingBuffer {
        self.ring.clone()
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.scheduler.add_cycles(cycles);
    }

    pub fn step(&mut self, source: &mut dyn SampleSource) {
        while let Some((event, cycles_late)) = self.scheduler.pop_due() {
            match event {
                Event::Channel(ch) => self.step_channel(ch as usize, cycles_late, source),
                Event::MixerSnapshot => self.step_mixer(cycles_late),
            }
        }
    }

    fn step_channel(&mut self, ch: usize, cycles_late: u64, source: &mut dyn SampleSource) {
        let channel = self.channels[ch];
        if !channel.running {
            return;
        }

        match source.next_sample(ch, channel.src_address, channel.format) {
            SampleResult::Value(sample) => {
                let gain = channel.gain();
                let (left_gain, right_gain) = channel.pan_gains();
                self.accumulator.0 += sample * gain * left_gain;
                self.accumulator.1 += sample * gain * right_gain;
            }
            SampleResult::Finished => {
                if channel.repeat_mode == RepeatMode::Manual || channel.repeat_mode == RepeatMode::OneShot {
                    self.channels[ch].running = false;
                    return;
                }
                // Infinite/Prohibited: keep scheduling: an infinite source loops its own
                // cursor internally and never actually returns Finished in steady state.
            }
        }

        let delay = channel.period_cycles().saturating_sub(cycles_late);
        if let Err(err) = self.scheduler.add(delay, Event::Channel(ch as u8)) {
            tracing::error!(?err, ch, "apu scheduler heap exhausted rescheduling channel");
        }
    }

    fn step_mixer(&mut self, cycles_late: u64) {
        let (left, right) = self.accumulator;
        let clamp = |v: f32| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        let frame = (clamp(left), clamp(right));
        {
            let mut ring = self.ring.lock().expect("apu ring buffer mutex poisoned");
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
                tracing::warn!("apu ring buffer full, dropping oldest frame");
            }
            ring.push_back(frame);
        }
        self.accumulator = (0.0, 0.0);

        let delay = MIXER_PERIOD_CYCLES.saturating_sub(cycles_late);
        if let Err(err) = self.scheduler.add(delay, Event::MixerSnapshot) {
            tracing::error!(?err, "apu scheduler heap exhausted rescheduling mixer snapshot");
        }
    }

    fn cnt(&self, ch: usize) -> u32 {
        let c = &self.channels[ch];
        let format_bits: u32 = match c.format {
            Format::Pcm8 => 0,
            Format::Pcm16 => 1,
            Format::Adpcm => 2,
            Format::Psg => 3,
        };
        let repeat_bits: u32 = match c.repeat_mode {
            RepeatMode::Manual => 0,
            RepeatMode::Infinite => 1,
            RepeatMode::OneShot => 2,
            RepeatMode::Prohibited => 3,
        };
        (c.volume_mul as u32)
            | ((c.volume_div as u32) << 8)
            | ((c.hold as u32) << 15)
            | ((c.panning as u32) << 16)
            | ((c.psg_wave_duty as u32) << 24)
            | (repeat_bits << 27)
            | (format_bits << 29)
            | ((c.running as u32) << 31)
    }

    fn write_cnt(&mut self, ch: usize, value: u32) {
        let was_running = self.channels[ch].running;
        {
            let c = &mut self.channels[ch];
            c.volume_mul = (value & 0x7F) as u8;
            c.volume_div = ((value >> 8) & 0x3) as u8;
            c.hold = value & (1 << 15) != 0;
            c.panning = ((value >> 16) & 0x7F) as u8;
            c.psg_wave_duty = ((value >> 24) & 0x7) as u8;
            c.repeat_mode = match (value >> 27) & 0x3 {
                0 => RepeatMode::Manual,
                1 => RepeatMode::Infinite,
                2 => RepeatMode::OneShot,
                _ => RepeatMode::Prohibited,
            };
            c.format = match (value >> 29) & 0x3 {
                0 => Format::Pcm8,
                1 => Format::Pcm16,
                2 => Format::Adpcm,
                _ => Format::Psg,
            };
            c.running = value & (1 << 31) != 0;
        }

        if !was_running && self.channels[ch].running {
            let period = self.channels[ch].period_cycles();
            if let Err(err) = self.scheduler.add(period, Event::Channel(ch as u8)) {
                tracing::error!(?err, ch, "apu scheduler heap exhausted arming channel start");
            }
        }
    }

    pub fn sad(&self, ch: usize) -> u32 {
        self.channels[ch].src_address
    }
    pub fn write_sad(&mut self, ch: usize, value: u32) {
        self.channels[ch].src_address = value;
    }
    pub fn tmr(&self, ch: usize) -> u16 {
        self.channels[ch].timer_duty
    }
    pub fn write_tmr(&mut self, ch: usize, value: u16) {
        self.channels[ch].timer_duty = value;
    }
    pub fn pnt(&self, ch: usize) -> u16 {
        self.channels[ch].loop_start
    }
    pub fn write_pnt(&mut self, ch: usize, value: u16) {
        self.channels[ch].loop_start = value;
    }
    pub fn len(&self, ch: usize) -> u32 {
        self.channels[ch].length
    }
    pub fn write_len(&mut self, ch: usize, value: u32) {
        self.channels[ch].length = value & 0x001F_FFFF;
    }
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains up to `out.len() / 2` stereo frames from `ring` into `out` (interleaved L/R),
/// emitting silence for any frames the ring couldn't supply. Called from the host audio
/// thread; takes the ring handle directly rather than an `Apu` reference since the
/// simulation thread owns the rest of `Apu`'s state.
pub fn drain_into(ring: &SharedRingBuffer, out: &mut [i16]) {
    let mut ring = ring.lock().expect("apu ring buffer mutex poisoned");
    for frame in out.chunks_mut(2) {
        let (l, r) = ring.pop_front().unwrap_or((0, 0));
        frame[0] = l;
        if frame.len() > 1 {
            frame[1] = r;
        }
    }
}

use std::cell::RefCell;
use std::rc::Rc;

pub type SharedApu = Rc<RefCell<Apu>>;

pub struct CntRegister {
    pub apu: SharedApu,
    pub channel: usize,
}
impl MmioRegister for CntRegister {
    fn width(&self) -> u8 {
        4
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.apu.borrow().cnt(self.channel) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let shift = sub_offset * 8;
        let mut current = self.apu.borrow().cnt(self.channel);
        current = (current & !(0xFFu32 << shift)) | ((value as u32) << shift);
        self.apu.borrow_mut().write_cnt(self.channel, current);
    }
    fn write_u32(&mut self, _sub_offset: u8, value: u32) {
        self.apu.borrow_mut().write_cnt(self.channel, value);
    }
}

pub struct SadRegister {
    pub apu: SharedApu,
    pub channel: usize,
}
impl MmioRegister for SadRegister {
    fn width(&self) -> u8 {
        4
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.apu.borrow().sad(self.channel) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let shift = sub_offset * 8;
        let mut current = self.apu.borrow().sad(self.channel);
        current = (current & !(0xFFu32 << shift)) | ((value as u32) << shift);
        self.apu.borrow_mut().write_sad(self.channel, current);
    }
}

pub struct TmrRegister {
    pub apu: SharedApu,
    pub channel: usize,
}
impl MmioRegister for TmrRegister {
    fn width(&self) -> u8 {
        2
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.apu.borrow().tmr(self.channel) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let shift = sub_offset * 8;
        let mut current = self.apu.borrow().tmr(self.channel);
        current = (current & !(0xFFu16 << shift)) | ((value as u16) << shift);
        self.apu.borrow_mut().write_tmr(self.channel, current);
    }
}

pub struct PntRegister {
    pub apu: SharedApu,
    pub channel: usize,
}
impl MmioRegister for PntRegister {
    fn width(&self) -> u8 {
        2
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.apu.borrow().pnt(self.channel) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let shift = sub_offset * 8;
        let mut current = self.apu.borrow().pnt(self.channel);
        current = (current & !(0xFFu16 << shift)) | ((value as u16) << shift);
        self.apu.borrow_mut().write_pnt(self.channel, current);
    }
}

pub struct LenRegister {
    pub apu: SharedApu,
    pub channel: usize,
}
impl MmioRegister for LenRegister {
    fn width(&self) -> u8 {
        4
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.apu.borrow().len(self.channel) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let shift = sub_offset * 8;
        let mut current = self.apu.borrow().len(self.channel);
        current = (current & !(0xFFu32 << shift)) | ((value as u32) << shift);
        self.apu.borrow_mut().write_len(self.channel, current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstantTone(f32);
    impl SampleSource for ConstantTone {
        fn next_sample(&mut self, _channel: usize, _src_address: u32, _format: Format) -> SampleResult {
            SampleResult::Value(self.0)
        }
    }

    struct OneShotSilence;
    impl SampleSource for OneShotSilence {
        fn next_sample(&mut self, _channel: usize, _src_address: u32, _format: Format) -> SampleResult {
            SampleResult::Finished
        }
    }

    #[test]
    fn enabling_a_channel_schedules_it_and_it_reaches_the_mixer() {
        let mut apu = Apu::new();
        apu.write_tmr(0, 0); // period = 0x10000 cycles
        apu.write_cnt(0, (1u32 << 31) | 127); // running, full volume, div 0
        let mut source = ConstantTone(1.0);

        apu.add_cycles(0x1_0000);
        apu.step(&mut source);
        assert_ne!(apu.accumulator, (0.0, 0.0));
    }

    #[test]
    fn panning_fully_right_silences_the_left_channel() {
        let mut apu = Apu::new();
        apu.write_tmr(0, 0);
        apu.write_cnt(0, (1u32 << 31) | 127 | (127 << 16)); // running, full vol, pan right
        let mut source = ConstantTone(1.0);
        apu.add_cycles(0x1_0000);
        apu.step(&mut source);
        assert_eq!(apu.accumulator.0, 0.0);
        assert!(apu.accumulator.1 > 0.0);
    }

    #[test]
    fn one_shot_channel_stops_after_finishing() {
        let mut apu = Apu::new();
        apu.write_tmr(0, 0);
        apu.write_cnt(0, (1u32 << 31) | 127); // repeat_mode defaults to Manual
        let mut source = OneShotSilence;
        apu.add_cycles(0x1_0000);
        apu.step(&mut source);
        assert_eq!(apu.cnt(0) & (1 << 31), 0);
    }

    #[test]
    fn mixer_snapshot_pushes_a_frame_into_the_ring() {
        let mut apu = Apu::new();
        let ring = apu.ring();
        apu.add_cycles(MIXER_PERIOD_CYCLES);
        apu.step(&mut OneShotSilence);
        assert_eq!(ring.lock().unwrap().len(), 1);
    }

    #[test]
    fn draining_more_than_available_emits_silence() {
        let mut apu = Apu::new();
        let ring = apu.ring();
        apu.add_cycles(MIXER_PERIOD_CYCLES);
        apu.step(&mut OneShotSilence);

        let mut out = [0i16; 8]; // 4 stereo frames requested, only 1 produced
        drain_into(&ring, &mut out);
        assert_eq!(&out[2..], [0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn cnt_register_round_trips_through_byte_dispatch() {
        let apu: SharedApu = Rc::new(RefCell::new(Apu::new()));
        let mut reg = CntRegister { apu: apu.clone(), channel: 3 };
        let value = (1u32 << 31) | (2 << 29) | (1 << 27) | (5 << 24) | (64 << 16) | (1 << 15) | (2 << 8) | 100;
        for i in 0..4u8 {
            reg.write_byte(i, ((value >> (i * 8)) & 0xFF) as u8);
        }
        assert_eq!(apu.borrow().cnt(3), value);
    }
}
