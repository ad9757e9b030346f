//! Per-CPU timer bank: four 16-bit up-counters with prescaler, cascade, and
//! IRQ-on-overflow, per §4.7. Each bank owns its own `Scheduler<u8>` (payload is the
//! overflowing channel index) rather than sharing the driver's top-level scheduler —
//! overflow is purely internal bookkeeping for this component, and keeping it local
//! avoids a cross-crate event enum that every hardware block would have to agree on.

use duocore_interrupts::InterruptSource;
use duocore_mem::MmioRegister;
use duocore_scheduler::Scheduler;
use std::cell::RefCell;
use std::rc::Rc;

const CHANNEL_COUNT: usize = 4;

fn shift_for(prescaler: u8) -> u32 {
    match prescaler & 0b11 {
        0 => 0,
        1 => 6,
        2 => 8,
        _ => 10,
    }
}

fn source_for_channel(ch: usize) -> InterruptSource {
    match ch {
        0 => InterruptSource::TIMER0,
        1 => InterruptSource::TIMER1,
        2 => InterruptSource::TIMER2,
        _ => InterruptSource::TIMER3,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct TimerChannel {
    reload: u16,
    counter: u16,
    prescaler: u8,
    cascade: bool,
    interrupt_on_overflow: bool,
    enable: bool,
    timestamp_started: u64,
}

/// Four timer channels sharing one scheduler. Channels index 0..3; channel `n`'s cascade
/// input is channel `n - 1`'s overflow.
pub struct TimerBank {
    channels: [TimerChannel; CHANNEL_COUNT],
    scheduled: [Option<duocore_scheduler::EventHandle>; CHANNEL_COUNT],
    scheduler: Scheduler<u8>,
}

impl TimerBank {
    pub fn new() -> Self {
        Self {
            channels: [TimerChannel::default(); CHANNEL_COUNT],
            scheduled: Default::default(),
            scheduler: Scheduler::new(),
        }
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.scheduler.add_cycles(cycles);
    }

    /// Drains due overflow events, reloading counters, raising IRQs, and cascading into
    /// the next channel up.
    pub fn step(&mut self, irq: &mut duocore_interrupts::IrqController) {
        while let Some((ch, cycles_late)) = self.scheduler.pop_due() {
            self.scheduled[ch as usize] = None;
            self.overflow(ch as usize, cycles_late, irq);
        }
    }

    fn overflow(&mut self, ch: usize, cycles_late: u64, irq: &mut duocore_interrupts::IrqController) {
        let now = self.scheduler.now();
        {
            let channel = &mut self.channels[ch];
            channel.counter = channel.reload;
            channel.timestamp_started = now - cycles_late;
            if channel.interrupt_on_overflow {
                irq.raise(source_for_channel(ch));
            }
            if !channel.cascade {
                let shift = shift_for(channel.prescaler);
                let period = ((0x10000u32 - channel.reload as u32) as u64) << shift;
                let delay = period.saturating_sub(cycles_late);
                if let Ok(h) = self.scheduler.add(delay, ch as u8) {
                    self.scheduled[ch] = Some(h);
                }
            }
        }

        let next = ch + 1;
        if next < CHANNEL_COUNT {
            let cascades = self.channels[next].enable && self.channels[next].cascade;
            if cascades {
                self.channels[next].counter = self.channels[next].counter.wrapping_add(1);
                if self.channels[next].counter == 0 {
                    self.overflow(next, 0, irq);
                }
            }
        }
    }

    /// Reconstructs the live counter per §4.7: `counter_at_last_update + (now -
    /// timestamp_started) >> shift`. Cascaded or disabled channels return their stored
    /// counter directly, since they don't advance with wall-clock time.
    pub fn read_counter(&self, ch: usize) -> u16 {
        let channel = &self.channels[ch];
        if !channel.enable || channel.cascade {
            return channel.counter;
        }
        let shift = shift_for(channel.prescaler);
        let elapsed = self.scheduler.now() - channel.timestamp_started;
        channel.counter.wrapping_add((elapsed >> shift) as u16)
    }

    pub fn write_reload(&mut self, ch: usize, value: u16) {
        self.channels[ch].reload = value;
    }

    pub fn reload(&self, ch: usize) -> u16 {
        self.channels[ch].reload
    }

    /// Decodes a TMxCNT_H write: bits 0-1 prescaler, bit 2 cascade, bit 6 IRQ-on-overflow,
    /// bit 7 enable. Handles the three transitions named in §4.7/§8: 0->1 loads the
    /// counter from reload and (if not cascade) arms the overflow event; staying enabled
    /// while reconfiguring restarts the live counter under the new prescaler/cascade
    /// without losing progress; 1->0 freezes the counter and disarms the event.
    pub fn write_control(&mut self, ch: usize, value: u16) {
        let prescaler = (value & 0b11) as u8;
        let cascade = value & (1 << 2) != 0;
        let interrupt_on_overflow = value & (1 << 6) != 0;
        let enable = value & (1 << 7) != 0;
        let now = self.scheduler.now();

        let was_enabled = self.channels[ch].enable;

        if was_enabled {
            let live = self.read_counter(ch);
            if let Some(h) = self.scheduled[ch].take() {
                self.scheduler.cancel(&h);
            }
            self.channels[ch].counter = live;
        }

        let channel = &mut self.channels[ch];
        channel.prescaler = prescaler;
        channel.cascade = cascade;
        channel.interrupt_on_overflow = interrupt_on_overflow;

        if !was_enabled && enable {
            channel.counter = channel.reload;
            channel.timestamp_started = now;
        } else if was_enabled && enable {
            channel.timestamp_started = now;
        }
        channel.enable = enable;

        if enable && !cascade {
            let counter = channel.counter;
            let shift = shift_for(prescaler);
            let delay = ((0x10000u32 - counter as u32) as u64) << shift;
            if let Ok(h) = self.scheduler.add(delay, ch as u8) {
                self.scheduled[ch] = Some(h);
            }
        }
    }

    pub fn control(&self, ch: usize) -> u16 {
        let channel = &self.channels[ch];
        (channel.prescaler as u16)
            | ((channel.cascade as u16) << 2)
            | ((channel.interrupt_on_overflow as u16) << 6)
            | ((channel.enable as u16) << 7)
    }
}

impl Default for TimerBank {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedTimerBank = Rc<RefCell<TimerBank>>;

/// TMxCNT_L: reads the live counter; writes set the reload value (the hardware latches
/// the write and only applies it to `counter` on the next enable transition).
pub struct CounterRegister {
    pub bank: SharedTimerBank,
    pub channel: usize,
}

impl MmioRegister for CounterRegister {
    fn width(&self) -> u8 {
        2
    }
    fn read_u16(&mut self, _sub_offset: u8) -> u16 {
        self.bank.borrow().read_counter(self.channel)
    }
    fn write_u16(&mut self, _sub_offset: u8, value: u16) {
        self.bank.borrow_mut().write_reload(self.channel, value);
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.read_u16(0) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let mut current = self.bank.borrow().reload(self.channel);
        let shift = sub_offset * 8;
        current = (current & !(0xFFu16 << shift)) | ((value as u16) << shift);
        self.bank.borrow_mut().write_reload(self.channel, current);
    }
}

/// TMxCNT_H: prescaler/cascade/IRQ/enable control bits.
pub struct ControlRegister {
    pub bank: SharedTimerBank,
    pub channel: usize,
}

impl MmioRegister for ControlRegister {
    fn width(&self) -> u8 {
        2
    }
    fn read_u16(&mut self, _sub_offset: u8) -> u16 {
        self.bank.borrow().control(self.channel)
    }
    fn write_u16(&mut self, _sub_offset: u8, value: u16) {
        self.bank.borrow_mut().write_control(self.channel, value);
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.read_u16(0) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let mut current = self.read_u16(0);
        let shift = sub_offset * 8;
        current = (current & !(0xFFu16 << shift)) | ((value as u16) << shift);
        self.write_u16(0, current);
    }
}
