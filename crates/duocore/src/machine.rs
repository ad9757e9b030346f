//! Dependency-injection root: owns both CPUs, both memory fabrics, and every hardware
//! block around them, and wires each block's MMIO registers into the fabric each CPU
//! sees. This is the one place in the workspace that is allowed to know about every
//! other crate at once.

use std::cell::RefCell;
use std::rc::Rc;

use duocore_apu::{Apu, CntRegister as ApuCntRegister, LenRegister, PntRegister, SadRegister as ApuSadRegister, SharedApu, TmrRegister};
use duocore_cart::Cartridge;
use duocore_coprocessor::Coprocessor;
use duocore_cpu::{CpuCore, InstructionExecutor, StepOutcome};
use duocore_dma::{CntHRegister, CntLRegister, DadRegister, DmaBank, SadRegister as DmaSadRegister, SharedDmaBank};
use duocore_display::{Cpu as DisplaySide, DisplayContext, DisplayTick, DisplayUnit, PixelProcessor, FRAME_HEIGHT, FRAME_WIDTH};
use duocore_interrupts::{IeRegister, IfRegister, ImeRegister, IrqController, SharedIrqController};
use duocore_ipc::{FifoCntRegister, FifoRecvRegister, FifoSendRegister, IpcUnit, SharedIpcUnit, Side, SyncRegister};
use duocore_mem::{AudioBus, MainBus, MmioRegister, Region, SharedWram, MAIN_RAM_SIZE};
use duocore_spi::{CntRegister as SpiCntRegister, DataRegister as SpiDataRegister, SharedSpiBus, SpiBus, SpiDevice};
use duocore_timers::{ControlRegister, CounterRegister, SharedTimerBank, TimerBank};

use crate::config::Config;
use crate::devices::{AudioDevice, InputDevice, NullInputDevice, VideoDevice};
use crate::fetch::{AudioFetch, MainFetch};

/// Byte width of each CPU's MMIO window. Sized to comfortably hold every register this
/// driver maps; real hardware's window is much larger but mostly unused address space.
const MMIO_WINDOW_SIZE: u32 = 0x1000;

const DISPSTAT_OFFSET: u32 = 0x004;
const VCOUNT_OFFSET: u32 = 0x006;

const DMA_BASE: u32 = 0x0B0;
const DMA_STRIDE: u32 = 0x0C;

const TIMER_BASE: u32 = 0x100;
const TIMER_STRIDE: u32 = 0x04;

const IPC_SYNC_OFFSET: u32 = 0x180;
const IPC_FIFOCNT_OFFSET: u32 = 0x184;
const IPC_FIFOSEND_OFFSET: u32 = 0x188;
/// Real hardware maps IPCFIFORECV in a separate address window (0x04100000) from the
/// rest of the MMIO block; folding it into the same window at its own offset avoids
/// teaching the fabric a second decode branch for a single register.
const IPC_FIFORECV_OFFSET: u32 = 0x190;

const SPI_CNT_OFFSET: u32 = 0x1C0;
const SPI_DATA_OFFSET: u32 = 0x1C2;

const WRAMCNT_OFFSET: u32 = 0x247;

const IME_OFFSET: u32 = 0x208;
const IE_OFFSET: u32 = 0x210;
const IF_OFFSET: u32 = 0x214;

const APU_BASE: u32 = 0x400;
const APU_STRIDE: u32 = 0x10;

/// WRAMCNT, per §4.2's shared-WRAM split. Main-CPU-writable only; the audio bus never
/// maps this offset.
struct WramCntRegister {
    wram: Rc<RefCell<SharedWram>>,
}

impl MmioRegister for WramCntRegister {
    fn width(&self) -> u8 {
        1
    }
    fn read_byte(&mut self, _sub_offset: u8) -> u8 {
        self.wram.borrow().split()
    }
    fn write_byte(&mut self, _sub_offset: u8, value: u8) {
        self.wram.borrow_mut().set_split(value & 0b11);
    }
}

/// DISPSTAT, mapped once per CPU side against the one shared `DisplayUnit`.
struct DispStatRegister {
    display: Rc<RefCell<DisplayUnit>>,
    side: DisplaySide,
}

impl MmioRegister for DispStatRegister {
    fn width(&self) -> u8 {
        2
    }
    fn read_u16(&mut self, _sub_offset: u8) -> u16 {
        self.display.borrow().dispstat_read(self.side)
    }
    fn write_u16(&mut self, _sub_offset: u8, value: u16) {
        self.display.borrow_mut().dispstat_write(self.side, value);
    }
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.read_u16(0) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, sub_offset: u8, value: u8) {
        let shift = sub_offset * 8;
        let mut current = self.display.borrow().dispstat_read(self.side);
        current = (current & !(0xFFu16 << shift)) | ((value as u16) << shift);
        self.display.borrow_mut().dispstat_write(self.side, current);
    }
}

/// VCOUNT, read-only; writes are dropped per real hardware's behavior for this register.
struct VcountRegister {
    display: Rc<RefCell<DisplayUnit>>,
}

impl MmioRegister for VcountRegister {
    fn width(&self) -> u8 {
        2
    }
    fn read_u16(&mut self, _sub_offset: u8) -> u16 {
        self.display.borrow().vcount()
    }
    fn write_u16(&mut self, _sub_offset: u8, _value: u16) {}
    fn read_byte(&mut self, sub_offset: u8) -> u8 {
        (self.read_u16(0) >> (sub_offset * 8)) as u8
    }
    fn write_byte(&mut self, _sub_offset: u8, _value: u8) {}
}

/// Stands in for the four SPI daughter devices (RTC/power, firmware, touchscreen, backup)
/// until the host wires up a real one. Accepts any transfer and echoes zero, matching the
/// "transfer is idempotent outside an active selection" modeling choice `duocore-spi`
/// documents for devices that never got selected.
#[derive(Default)]
struct NullSpiDevice;

impl SpiDevice for NullSpiDevice {
    fn select(&mut self) {}
    fn deselect(&mut self) {}
    fn transfer(&mut self, _byte: u8) -> u8 {
        0
    }
}

/// No-op decoder. Real instruction decode/execute is out of scope for this driver;
/// `NopExecutor` exists so `Machine::run` can exercise the CPU cores' fetch/IRQ/WFI state
/// machine end to end without one. It never branches and never advances the program
/// counter, so a real decoder is the only thing that makes forward progress meaningful.
pub struct NopExecutor;

impl<B> InstructionExecutor<B> for NopExecutor {
    fn execute_arm(&mut self, _core: &mut CpuCore, _bus: &mut B, _instruction: u32) {}
    fn execute_thumb(&mut self, _core: &mut CpuCore, _bus: &mut B, _instruction: u16) {}
}

/// Bundles the collaborators a single `run` call needs but `Machine` never stores: the
/// pluggable decoders for both cores, the pluggable rasterizers for both screens, and the
/// pluggable waveform sample source. None of these have a meaningful default the way a
/// host device does, so they're supplied at the call site rather than through a setter.
pub struct RunCollaborators<'a, EM, EA> {
    pub executor_main: &'a mut EM,
    pub executor_audio: &'a mut EA,
    pub pixel_main: &'a mut dyn PixelProcessor,
    pub pixel_audio: &'a mut dyn PixelProcessor,
    pub sample_source: &'a mut dyn duocore_apu::SampleSource,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub main_cycles_run: u64,
    pub frames_completed: u32,
}

pub struct Machine {
    config: Config,

    main_ram: Rc<RefCell<Region>>,
    wram: Rc<RefCell<SharedWram>>,
    main_bus: MainBus,
    audio_bus: AudioBus,

    irq_main: SharedIrqController,
    irq_audio: SharedIrqController,

    timers_main: SharedTimerBank,
    timers_audio: SharedTimerBank,

    dma_main: SharedDmaBank,
    dma_audio: SharedDmaBank,

    ipc: SharedIpcUnit,
    display: Rc<RefCell<DisplayUnit>>,
    apu: SharedApu,
    spi: SharedSpiBus,

    coprocessor: Coprocessor,

    cpu_main: CpuCore,
    cpu_audio: CpuCore,

    input: Rc<RefCell<Box<dyn InputDevice>>>,
    audio_device: Option<Box<dyn AudioDevice>>,
    video_device: Option<Box<dyn VideoDevice>>,

    frame_main: Vec<u8>,
    frame_audio: Vec<u8>,
}

impl Machine {
    pub fn new(config: Config) -> Self {
        let main_ram = Rc::new(RefCell::new(Region::new(MAIN_RAM_SIZE)));
        let wram = Rc::new(RefCell::new(SharedWram::new()));
        wram.borrow_mut().set_split(config.initial_wram_split);

        let mut main_bus = MainBus::new(main_ram.clone(), wram.clone(), MMIO_WINDOW_SIZE);
        let mut audio_bus = AudioBus::new(wram.clone(), MMIO_WINDOW_SIZE);

        let irq_main: SharedIrqController = Rc::new(RefCell::new(IrqController::new()));
        let irq_audio: SharedIrqController = Rc::new(RefCell::new(IrqController::new()));

        let timers_main: SharedTimerBank = Rc::new(RefCell::new(TimerBank::new()));
        let timers_audio: SharedTimerBank = Rc::new(RefCell::new(TimerBank::new()));

        let dma_main: SharedDmaBank = Rc::new(RefCell::new(DmaBank::new(irq_main.clone())));
        let dma_audio: SharedDmaBank = Rc::new(RefCell::new(DmaBank::new(irq_audio.clone())));

        let ipc: SharedIpcUnit = Rc::new(RefCell::new(IpcUnit::new(irq_main.clone(), irq_audio.clone())));

        let display = Rc::new(RefCell::new(DisplayUnit::new()));

        let apu: SharedApu = Rc::new(RefCell::new(Apu::new()));

        // SPI lives on the audio core on real hardware (the low-end core is the one wired
        // to the RTC/firmware/touchscreen/backup bus), so it raises on `irq_audio`.
        let spi: SharedSpiBus = Rc::new(RefCell::new(SpiBus::new(
            Box::new(NullSpiDevice),
            Box::new(NullSpiDevice),
            Box::new(NullSpiDevice),
            Box::new(NullSpiDevice),
            irq_audio.clone(),
        )));

        let coprocessor = Coprocessor::new(&mut main_bus);

        let cpu_main = CpuCore::new();
        let cpu_audio = CpuCore::new();

        let input: Rc<RefCell<Box<dyn InputDevice>>> = Rc::new(RefCell::new(Box::new(NullInputDevice)));

        let mut machine = Self {
            config,
            main_ram,
            wram,
            main_bus,
            audio_bus,
            irq_main,
            irq_audio,
            timers_main,
            timers_audio,
            dma_main,
            dma_audio,
            ipc,
            display,
            apu,
            spi,
            coprocessor,
            cpu_main,
            cpu_audio,
            input,
            audio_device: None,
            video_device: None,
            frame_main: vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4],
            frame_audio: vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 4],
        };

        machine.map_registers();
        machine
    }

    fn map_registers(&mut self) {
        self.main_bus
            .mmio
            .map(DISPSTAT_OFFSET, Rc::new(RefCell::new(DispStatRegister { display: self.display.clone(), side: DisplaySide::Main })))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(DISPSTAT_OFFSET, Rc::new(RefCell::new(DispStatRegister { display: self.display.clone(), side: DisplaySide::Audio })))
            .expect("static register map must not overlap");
        self.main_bus
            .mmio
            .map(VCOUNT_OFFSET, Rc::new(RefCell::new(VcountRegister { display: self.display.clone() })))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(VCOUNT_OFFSET, Rc::new(RefCell::new(VcountRegister { display: self.display.clone() })))
            .expect("static register map must not overlap");

        for ch in 0..4usize {
            let base = DMA_BASE + ch as u32 * DMA_STRIDE;
            self.main_bus
                .mmio
                .map(base, Rc::new(RefCell::new(DmaSadRegister { bank: self.dma_main.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0x4, Rc::new(RefCell::new(DadRegister { bank: self.dma_main.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0x8, Rc::new(RefCell::new(CntLRegister { bank: self.dma_main.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0xA, Rc::new(RefCell::new(CntHRegister { bank: self.dma_main.clone(), channel: ch })))
                .expect("static register map must not overlap");

            self.audio_bus
                .mmio
                .map(base, Rc::new(RefCell::new(DmaSadRegister { bank: self.dma_audio.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.audio_bus
                .mmio
                .map(base + 0x4, Rc::new(RefCell::new(DadRegister { bank: self.dma_audio.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.audio_bus
                .mmio
                .map(base + 0x8, Rc::new(RefCell::new(CntLRegister { bank: self.dma_audio.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.audio_bus
                .mmio
                .map(base + 0xA, Rc::new(RefCell::new(CntHRegister { bank: self.dma_audio.clone(), channel: ch })))
                .expect("static register map must not overlap");
        }

        for ch in 0..4usize {
            let base = TIMER_BASE + ch as u32 * TIMER_STRIDE;
            self.main_bus
                .mmio
                .map(base, Rc::new(RefCell::new(CounterRegister { bank: self.timers_main.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0x2, Rc::new(RefCell::new(ControlRegister { bank: self.timers_main.clone(), channel: ch })))
                .expect("static register map must not overlap");

            self.audio_bus
                .mmio
                .map(base, Rc::new(RefCell::new(CounterRegister { bank: self.timers_audio.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.audio_bus
                .mmio
                .map(base + 0x2, Rc::new(RefCell::new(ControlRegister { bank: self.timers_audio.clone(), channel: ch })))
                .expect("static register map must not overlap");
        }

        self.main_bus
            .mmio
            .map(IPC_SYNC_OFFSET, Rc::new(RefCell::new(SyncRegister { ipc: self.ipc.clone(), side: Side::Main })))
            .expect("static register map must not overlap");
        self.main_bus
            .mmio
            .map(IPC_FIFOCNT_OFFSET, Rc::new(RefCell::new(FifoCntRegister { ipc: self.ipc.clone(), side: Side::Main })))
            .expect("static register map must not overlap");
        self.main_bus
            .mmio
            .map(IPC_FIFOSEND_OFFSET, Rc::new(RefCell::new(FifoSendRegister::new(self.ipc.clone(), Side::Main))))
            .expect("static register map must not overlap");
        self.main_bus
            .mmio
            .map(IPC_FIFORECV_OFFSET, Rc::new(RefCell::new(FifoRecvRegister::new(self.ipc.clone(), Side::Main))))
            .expect("static register map must not overlap");

        self.audio_bus
            .mmio
            .map(IPC_SYNC_OFFSET, Rc::new(RefCell::new(SyncRegister { ipc: self.ipc.clone(), side: Side::Audio })))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(IPC_FIFOCNT_OFFSET, Rc::new(RefCell::new(FifoCntRegister { ipc: self.ipc.clone(), side: Side::Audio })))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(IPC_FIFOSEND_OFFSET, Rc::new(RefCell::new(FifoSendRegister::new(self.ipc.clone(), Side::Audio))))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(IPC_FIFORECV_OFFSET, Rc::new(RefCell::new(FifoRecvRegister::new(self.ipc.clone(), Side::Audio))))
            .expect("static register map must not overlap");

        self.main_bus
            .mmio
            .map(IME_OFFSET, Rc::new(RefCell::new(ImeRegister(self.irq_main.clone()))))
            .expect("static register map must not overlap");
        self.main_bus
            .mmio
            .map(IE_OFFSET, Rc::new(RefCell::new(IeRegister(self.irq_main.clone()))))
            .expect("static register map must not overlap");
        self.main_bus
            .mmio
            .map(IF_OFFSET, Rc::new(RefCell::new(IfRegister(self.irq_main.clone()))))
            .expect("static register map must not overlap");

        self.audio_bus
            .mmio
            .map(IME_OFFSET, Rc::new(RefCell::new(ImeRegister(self.irq_audio.clone()))))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(IE_OFFSET, Rc::new(RefCell::new(IeRegister(self.irq_audio.clone()))))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(IF_OFFSET, Rc::new(RefCell::new(IfRegister(self.irq_audio.clone()))))
            .expect("static register map must not overlap");

        self.audio_bus
            .mmio
            .map(SPI_CNT_OFFSET, Rc::new(RefCell::new(SpiCntRegister(self.spi.clone()))))
            .expect("static register map must not overlap");
        self.audio_bus
            .mmio
            .map(SPI_DATA_OFFSET, Rc::new(RefCell::new(SpiDataRegister(self.spi.clone()))))
            .expect("static register map must not overlap");

        self.main_bus
            .mmio
            .map(WRAMCNT_OFFSET, Rc::new(RefCell::new(WramCntRegister { wram: self.wram.clone() })))
            .expect("static register map must not overlap");

        for ch in 0..duocore_apu::CHANNEL_COUNT {
            let base = APU_BASE + ch as u32 * APU_STRIDE;
            self.main_bus
                .mmio
                .map(base, Rc::new(RefCell::new(ApuCntRegister { apu: self.apu.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0x4, Rc::new(RefCell::new(ApuSadRegister { apu: self.apu.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0x8, Rc::new(RefCell::new(TmrRegister { apu: self.apu.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0xA, Rc::new(RefCell::new(PntRegister { apu: self.apu.clone(), channel: ch })))
                .expect("static register map must not overlap");
            self.main_bus
                .mmio
                .map(base + 0xC, Rc::new(RefCell::new(LenRegister { apu: self.apu.clone(), channel: ch })))
                .expect("static register map must not overlap");
        }
    }

    /// Installs a cartridge image, copying both CPUs' binaries into their fabrics and
    /// resetting both cores to their declared entrypoints.
    pub fn load_cartridge(&mut self, cart: &Cartridge) {
        let entry = cart.install(&mut self.main_bus, &mut self.audio_bus);

        self.cpu_main.reset(self.coprocessor.exception_base());
        self.cpu_audio.reset(0);

        let mut main_fetch = MainFetch(&mut self.main_bus);
        self.cpu_main.branch_to(entry.main, &mut main_fetch);
        let mut audio_fetch = AudioFetch(&mut self.audio_bus);
        self.cpu_audio.branch_to(entry.audio, &mut audio_fetch);
    }

    pub fn set_input_device(&mut self, device: Box<dyn InputDevice>) {
        *self.input.borrow_mut() = device;
    }

    pub fn set_video_device(&mut self, device: Box<dyn VideoDevice>) {
        self.video_device = Some(device);
    }

    pub fn set_audio_device(&mut self, mut device: Box<dyn AudioDevice>) {
        device.open(self.apu.borrow().ring());
        tracing::info!(sample_rate = device.sample_rate(), block_size = device.block_size(), "audio device opened");
        self.audio_device = Some(device);
    }

    pub fn input_device(&self) -> Rc<RefCell<Box<dyn InputDevice>>> {
        self.input.clone()
    }

    /// Advances the simulation by `cycle_budget` main-CPU cycles, per §5's quantum loop:
    /// each iteration runs the audio CPU for `config.quantum_audio_cycles` cycles and the
    /// main CPU for twice that many, then drains every hardware block's scheduler.
    pub fn run<EM, EA>(&mut self, cycle_budget: u64, collab: &mut RunCollaborators<'_, EM, EA>) -> RunSummary
    where
        EM: for<'b> InstructionExecutor<MainFetch<'b>>,
        EA: for<'b> InstructionExecutor<AudioFetch<'b>>,
    {
        let mut summary = RunSummary::default();
        let main_cycles_per_quantum = self.config.quantum_audio_cycles * 2;

        while summary.main_cycles_run < cycle_budget {
            if matches!(self.quantum(collab), DisplayTick::FrameComplete) {
                summary.frames_completed += 1;
                if let Some(video) = self.video_device.as_mut() {
                    video.draw(&self.frame_main, &self.frame_audio);
                }
            }
            summary.main_cycles_run += main_cycles_per_quantum;
        }

        summary
    }

    fn quantum<EM, EA>(&mut self, collab: &mut RunCollaborators<'_, EM, EA>) -> DisplayTick
    where
        EM: for<'b> InstructionExecutor<MainFetch<'b>>,
        EA: for<'b> InstructionExecutor<AudioFetch<'b>>,
    {
        if self.coprocessor.wfi_requested() {
            self.cpu_main.set_wait_for_irq(true);
            self.coprocessor.clear_wfi();
        }

        let exception_base = self.coprocessor.exception_base();
        let main_cycles = self.config.quantum_audio_cycles * 2;
        let audio_cycles = self.config.quantum_audio_cycles;

        let irq_line_main = self.irq_main.borrow().line();
        let main_outcome = {
            let mut fetch = MainFetch(&mut self.main_bus);
            self.cpu_main.step(&mut fetch, collab.executor_main, irq_line_main, exception_base)
        };
        if matches!(main_outcome, StepOutcome::Idle) {
            tracing::trace!("main core idle (WFI)");
        }

        let irq_line_audio = self.irq_audio.borrow().line();
        let audio_outcome = {
            let mut fetch = AudioFetch(&mut self.audio_bus);
            // The audio core has no coprocessor, so it exits an IRQ exception at address 0.
            self.cpu_audio.step(&mut fetch, collab.executor_audio, irq_line_audio, 0)
        };
        if matches!(audio_outcome, StepOutcome::Idle) {
            tracing::trace!("audio core idle (WFI)");
        }

        self.dma_main.borrow_mut().service_immediate(&mut self.main_bus);
        self.dma_audio.borrow_mut().service_immediate(&mut self.audio_bus);

        self.timers_main.borrow_mut().add_cycles(main_cycles);
        {
            let mut irq = self.irq_main.borrow_mut();
            self.timers_main.borrow_mut().step(&mut irq);
        }
        self.timers_audio.borrow_mut().add_cycles(audio_cycles);
        {
            let mut irq = self.irq_audio.borrow_mut();
            self.timers_audio.borrow_mut().step(&mut irq);
        }

        self.display.borrow_mut().add_cycles(main_cycles);
        let tick = {
            let mut irq_main = self.irq_main.borrow_mut();
            let mut irq_audio = self.irq_audio.borrow_mut();
            let mut dma_main = self.dma_main.borrow_mut();
            let mut dma_audio = self.dma_audio.borrow_mut();
            let mut ctx = DisplayContext {
                irq_main: &mut irq_main,
                irq_audio: &mut irq_audio,
                dma_main: &mut dma_main,
                dma_audio: &mut dma_audio,
                main_bus: &mut self.main_bus,
                audio_bus: &mut self.audio_bus,
                pixel_main: collab.pixel_main,
                pixel_audio: collab.pixel_audio,
                frame_main: &mut self.frame_main,
                frame_audio: &mut self.frame_audio,
            };
            self.display.borrow_mut().step(&mut ctx)
        };

        self.apu.borrow_mut().add_cycles(audio_cycles);
        self.apu.borrow_mut().step(collab.sample_source);

        tick
    }
}
