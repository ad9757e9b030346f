//! Display timing: the scanline/dot counter state machine that drives VBlank/HBlank/
//! VCount interrupts and arms VBlank/HBlank-triggered DMA channels, per §4.9. Unlike
//! IPC and the interrupt controller, this component never needs to react to an MMIO
//! write mid-call — its own `step` is always invoked by the top-level driver — so it
//! takes every collaborator (IRQ controllers, DMA banks, memory buses, pixel processors)
//! as an explicit borrow for the duration of the call instead of storing any of them.

use duocore_dma::{DmaBank, DmaMemory, DmaTiming};
use duocore_interrupts::{InterruptSource, IrqController};
use duocore_mem::{AudioBus, MainBus};
use duocore_scheduler::Scheduler;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 192;
pub const DRAWING_LINES: u16 = 192;
pub const TOTAL_LINES: u16 = 263;
pub const DOTS_PER_LINE: u64 = 355;
pub const CYCLES_PER_DOT: u64 = 6;
pub const CYCLES_PER_LINE: u64 = DOTS_PER_LINE * CYCLES_PER_DOT;

/// Produces one 256x192 RGBA scanline on demand. The rasterizer itself (background
/// layers, windowing, blending, the 3D pipeline) is out of scope; this is the seam the
/// display timing unit calls into once per drawn line, per side.
pub trait PixelProcessor {
    fn render_scanline(&mut self, vcount: u16, out_rgba_row: &mut [u8]);
}

#[derive(Clone, Copy)]
pub enum Cpu {
    Main = 0,
    Audio = 1,
}

#[derive(Debug, Clone, Copy, Default)]
struct DispStat {
    vblank: bool,
    hblank: bool,
    vcount_flag: bool,
    vblank_irq_enable: bool,
    hblank_irq_enable: bool,
    vcount_irq_enable: bool,
    vcount_target: u16,
}

impl DispStat {
    fn read(&self) -> u16 {
        (self.vblank as u16)
            | ((self.hblank as u16) << 1)
            | ((self.vcount_flag as u16) << 2)
            | ((self.vblank_irq_enable as u16) << 3)
            | ((self.hblank_irq_enable as u16) << 4)
            | ((self.vcount_irq_enable as u16) << 5)
            | (((self.vcount_target >> 8) & 1) << 7)
            | ((self.vcount_target & 0xFF) << 8)
    }

    fn write(&mut self, value: u16) {
        self.vblank_irq_enable = value & (1 << 3) != 0;
        self.hblank_irq_enable = value & (1 << 4) != 0;
        self.vcount_irq_enable = value & (1 << 5) != 0;
        let high = (value >> 7) & 1;
        let low = (value >> 8) & 0xFF;
        self.vcount_target = (high << 8) | low;
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    HdrawBegin,
    HblankBegin,
    HblankFlagSet,
}

/// Returned from `step` when a frame's worth of scanlines has just finished being
/// produced (VBlank has begun), so the caller can hand its assembled frame buffers to
/// the host video device exactly once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayTick {
    Nothing,
    FrameComplete,
}

/// Collaborators a single `step` call may need to reach. Bundled into one struct rather
/// than passed as a long parameter list; none of these are stored past the call.
pub struct DisplayContext<'a> {
    pub irq_main: &'a mut IrqController,
    pub irq_audio: &'a mut IrqController,
    pub dma_main: &'a mut DmaBank,
    pub dma_audio: &'a mut DmaBank,
    pub main_bus: &'a mut MainBus,
    pub audio_bus: &'a mut AudioBus,
    pub pixel_main: &'a mut dyn PixelProcessor,
    pub pixel_audio: &'a mut dyn PixelProcessor,
    pub frame_main: &'a mut [u8],
    pub frame_audio: &'a mut [u8],
}

pub struct DisplayUnit {
    vcount: u16,
    dispstat: [DispStat; 2],
    scheduler: Scheduler<Event>,
}

impl DisplayUnit {
    pub fn new() -> Self {
        let mut scheduler = Scheduler::new();
        scheduler.add(0, Event::HdrawBegin).expect("fresh scheduler has room for the first event");
        Self {
            vcount: TOTAL_LINES - 1, // first HdrawBegin wraps this to 0
            dispstat: [DispStat::default(); 2],
            scheduler,
        }
    }

    pub fn add_cycles(&mut self, cycles: u64) {
        self.scheduler.add_cycles(cycles);
    }

    pub fn vcount(&self) -> u16 {
        self.vcount
    }

    pub fn dispstat_read(&self, cpu: Cpu) -> u16 {
        self.dispstat[cpu as usize].read()
    }

    pub fn dispstat_write(&mut self, cpu: Cpu, value: u16) {
        self.dispstat[cpu as usize].write(value);
    }

    /// Drains due display events, in timestamp order, against the given collaborators.
    /// Returns `DisplayTick::FrameComplete` if any drained event began VBlank, so the
    /// caller can present the just-finished frame.
    pub fn step(&mut self, ctx: &mut DisplayContext<'_>) -> DisplayTick {
        let mut tick = DisplayTick::Nothing;
        while let Some((event, cycles_late)) = self.scheduler.pop_due() {
            if matches!(self.dispatch(event, cycles_late, ctx), DisplayTick::FrameComplete) {
                tick = DisplayTick::FrameComplete;
            }
        }
        tick
    }

    fn dispatch(&mut self, event: Event, cycles_late: u64, ctx: &mut DisplayContext<'_>) -> DisplayTick {
        match event {
            Event::HdrawBegin => self.on_hdraw_begin(cycles_late, ctx),
            Event::HblankBegin => {
                self.on_hblank_begin(cycles_late, ctx);
                DisplayTick::Nothing
            }
            Event::HblankFlagSet => {
                self.on_hblank_flag_set(cycles_late, ctx);
                DisplayTick::Nothing
            }
        }
    }

    fn on_hdraw_begin(&mut self, cycles_late: u64, ctx: &mut DisplayContext<'_>) -> DisplayTick {
        self.vcount = (self.vcount + 1) % TOTAL_LINES;
        let mut tick = DisplayTick::Nothing;

        for side in [Cpu::Main, Cpu::Audio] {
            let stat = &mut self.dispstat[side as usize];
            let matched = stat.vcount_target == self.vcount;
            let was_matched = stat.vcount_flag;
            stat.vcount_flag = matched;
            if matched && !was_matched && stat.vcount_irq_enable {
                let irq = match side {
                    Cpu::Main => &mut *ctx.irq_main,
                    Cpu::Audio => &mut *ctx.irq_audio,
                };
                irq.raise(InterruptSource::VCOUNT);
            }
        }

        if self.vcount == DRAWING_LINES {
            for side in [Cpu::Main, Cpu::Audio] {
                self.dispstat[side as usize].vblank = true;
            }
            if self.dispstat[Cpu::Main as usize].vblank_irq_enable {
                ctx.irq_main.raise(InterruptSource::VBLANK);
            }
            if self.dispstat[Cpu::Audio as usize].vblank_irq_enable {
                ctx.irq_audio.raise(InterruptSource::VBLANK);
            }
            ctx.dma_main.request(DmaTiming::VBlank, ctx.main_bus);
            ctx.dma_audio.request(DmaTiming::VBlank, ctx.audio_bus);
            tick = DisplayTick::FrameComplete;
        }

        if self.vcount == TOTAL_LINES - 1 {
            for side in [Cpu::Main, Cpu::Audio] {
                self.dispstat[side as usize].vblank = false;
            }
        }

        for side in [Cpu::Main, Cpu::Audio] {
            self.dispstat[side as usize].hblank = false;
        }

        if self.vcount < DRAWING_LINES {
            let mut row_main = vec![0u8; FRAME_WIDTH * 4];
            ctx.pixel_main.render_scanline(self.vcount, &mut row_main);
            let offset = self.vcount as usize * FRAME_WIDTH * 4;
            ctx.frame_main[offset..offset + row_main.len()].copy_from_slice(&row_main);

            let mut row_audio = vec![0u8; FRAME_WIDTH * 4];
            ctx.pixel_audio.render_scanline(self.vcount, &mut row_audio);
            ctx.frame_audio[offset..offset + row_audio.len()].copy_from_slice(&row_audio);
        }

        let delay = 1536u64.saturating_sub(cycles_late);
        if let Err(err) = self.scheduler.add(delay, Event::HblankBegin) {
            tracing::error!(?err, "display scheduler heap exhausted arming HblankBegin");
        }

        tick
    }

    fn on_hblank_begin(&mut self, cycles_late: u64, ctx: &mut DisplayContext<'_>) {
        if self.dispstat[Cpu::Main as usize].hblank_irq_enable {
            ctx.irq_main.raise(InterruptSource::HBLANK);
        }
        if self.dispstat[Cpu::Audio as usize].hblank_irq_enable {
            ctx.irq_audio.raise(InterruptSource::HBLANK);
        }
        let delay = 70u64.saturating_sub(cycles_late);
        if let Err(err) = self.scheduler.add(delay, Event::HblankFlagSet) {
            tracing::error!(?err, "display scheduler heap exhausted arming HblankFlagSet");
        }
    }

    fn on_hblank_flag_set(&mut self, cycles_late: u64, ctx: &mut DisplayContext<'_>) {
        if self.vcount < DRAWING_LINES {
            ctx.dma_main.request(DmaTiming::HBlank, ctx.main_bus);
            ctx.dma_audio.request(DmaTiming::HBlank, ctx.audio_bus);
        }
        for side in [Cpu::Main, Cpu::Audio] {
            self.dispstat[side as usize].hblank = true;
        }
        let delay = 524u64.saturating_sub(cycles_late);
        if let Err(err) = self.scheduler.add(delay, Event::HdrawBegin) {
            tracing::error!(?err, "display scheduler heap exhausted arming HdrawBegin");
        }
    }
}

impl Default for DisplayUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duocore_interrupts::IrqController;
    use duocore_mem::{Region, SharedWram, MAIN_RAM_SIZE};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct BlankPixels;
    impl PixelProcessor for BlankPixels {
        fn render_scanline(&mut self, _vcount: u16, _out_rgba_row: &mut [u8]) {}
    }

    fn new_main_bus() -> MainBus {
        let ram = Rc::new(RefCell::new(Region::new(MAIN_RAM_SIZE)));
        let wram = Rc::new(RefCell::new(SharedWram::new()));
        MainBus::new(ram, wram, 0x10000)
    }

    fn new_audio_bus() -> AudioBus {
        let wram = Rc::new(RefCell::new(SharedWram::new()));
        AudioBus::new(wram, 0x10000)
    }

    #[test]
    fn vblank_irq_fires_exactly_once_after_192_lines() {
        let mut display = DisplayUnit::new();
        display.dispstat_write(Cpu::Main, 1 << 3); // enable VBlank IRQ

        let mut irq_main = IrqController::new();
        irq_main.set_master_enable(true);
        irq_main.set_enable_mask(InterruptSource::VBLANK.bits());
        let mut irq_audio = IrqController::new();
        let mut dma_main = DmaBank::new(Rc::new(RefCell::new(IrqController::new())));
        let mut dma_audio = DmaBank::new(Rc::new(RefCell::new(IrqController::new())));
        let mut main_bus = new_main_bus();
        let mut audio_bus = new_audio_bus();
        let mut pixel_main = BlankPixels;
        let mut pixel_audio = BlankPixels;
        let mut frame_main = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4];
        let mut frame_audio = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4];

        let mut vblank_count = 0;
        display.add_cycles(DRAWING_LINES as u64 * CYCLES_PER_LINE);
        {
            let mut ctx = DisplayContext {
                irq_main: &mut irq_main,
                irq_audio: &mut irq_audio,
                dma_main: &mut dma_main,
                dma_audio: &mut dma_audio,
                main_bus: &mut main_bus,
                audio_bus: &mut audio_bus,
                pixel_main: &mut pixel_main,
                pixel_audio: &mut pixel_audio,
                frame_main: &mut frame_main,
                frame_audio: &mut frame_audio,
            };
            display.step(&mut ctx);
        }

        if irq_main.pending_mask() & InterruptSource::VBLANK.bits() != 0 {
            vblank_count += 1;
        }
        assert_eq!(vblank_count, 1);
        assert!(irq_main.line());
    }

    #[test]
    fn vcount_wraps_across_the_full_frame() {
        let mut display = DisplayUnit::new();
        let mut irq_main = IrqController::new();
        let mut irq_audio = IrqController::new();
        let mut dma_main = DmaBank::new(Rc::new(RefCell::new(IrqController::new())));
        let mut dma_audio = DmaBank::new(Rc::new(RefCell::new(IrqController::new())));
        let mut main_bus = new_main_bus();
        let mut audio_bus = new_audio_bus();
        let mut pixel_main = BlankPixels;
        let mut pixel_audio = BlankPixels;
        let mut frame_main = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4];
        let mut frame_audio = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4];

        display.add_cycles(TOTAL_LINES as u64 * CYCLES_PER_LINE);
        let mut ctx = DisplayContext {
            irq_main: &mut irq_main,
            irq_audio: &mut irq_audio,
            dma_main: &mut dma_main,
            dma_audio: &mut dma_audio,
            main_bus: &mut main_bus,
            audio_bus: &mut audio_bus,
            pixel_main: &mut pixel_main,
            pixel_audio: &mut pixel_audio,
            frame_main: &mut frame_main,
            frame_audio: &mut frame_audio,
        };
        display.step(&mut ctx);
        assert_eq!(display.vcount(), 0);
    }
}
