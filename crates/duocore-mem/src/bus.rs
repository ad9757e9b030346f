use std::cell::RefCell;
use std::rc::Rc;

use crate::mmio::MmioRegistry;
use crate::region::Region;
use crate::tcm::{Tcm, TcmDescriptor};
use crate::wram::SharedWram;

/// Gates TCM visibility and is forwarded to region handlers that care, per §4.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusTag {
    Code,
    Data,
    System,
}

/// Physical sizes match real hardware: main RAM 4 MiB shared by both CPUs, main-CPU
/// I-TCM 32 KiB, main-CPU D-TCM 16 KiB, audio-CPU private internal RAM 64 KiB. VRAM is
/// modeled as a single flat region since per-bank mapping control (VRAMCNT) belongs to
/// the (out-of-scope) pixel-processor/rasterizer layer, not the kernel.
pub const MAIN_RAM_SIZE: u32 = 0x0040_0000;
pub const ITCM_PHYSICAL_SIZE: u32 = 0x8000;
pub const DTCM_PHYSICAL_SIZE: u32 = 0x4000;
pub const AUDIO_INTERNAL_RAM_SIZE: u32 = 0x1_0000;
pub const VRAM_SIZE: u32 = 0x0010_0000;

fn rotate_read_u16(value: u16, addr: u32) -> u16 {
    value.rotate_right((addr & 1) * 8)
}

fn rotate_read_u32(value: u32, addr: u32) -> u32 {
    value.rotate_right((addr & 3) * 8)
}

/// Per-CPU memory fabric for the main ("system") CPU: I/D-TCM ahead of the general map,
/// then main RAM, shared-WRAM view, MMIO, and VRAM, in address-decode order per §4.2.
pub struct MainBus {
    pub itcm: Tcm,
    pub dtcm: Tcm,
    main_ram: Rc<RefCell<Region>>,
    wram: Rc<RefCell<SharedWram>>,
    pub mmio: MmioRegistry,
    vram: Region,
}

impl MainBus {
    pub fn new(main_ram: Rc<RefCell<Region>>, wram: Rc<RefCell<SharedWram>>, mmio_window: u32) -> Self {
        Self {
            itcm: Tcm::new(ITCM_PHYSICAL_SIZE),
            dtcm: Tcm::new(DTCM_PHYSICAL_SIZE),
            main_ram,
            wram,
            mmio: MmioRegistry::new(mmio_window),
            vram: Region::new(VRAM_SIZE),
        }
    }

    pub fn set_itcm(&mut self, descriptor: TcmDescriptor) {
        self.itcm.set_descriptor(descriptor);
    }

    pub fn set_dtcm(&mut self, descriptor: TcmDescriptor) {
        self.dtcm.set_descriptor(descriptor);
    }

    fn region_selector(addr: u32) -> u8 {
        (addr >> 24) as u8
    }

    pub fn read_u8(&self, addr: u32, tag: BusTag) -> u8 {
        if self.itcm.covers(addr) && matches!(tag, BusTag::Code | BusTag::Data) {
            return self.itcm.read_u8(addr);
        }
        if matches!(tag, BusTag::Data) && self.dtcm.covers(addr) {
            return self.dtcm.read_u8(addr);
        }
        match Self::region_selector(addr) {
            0x02 => self.main_ram.borrow().read_u8(addr),
            0x03 => {
                let wram = self.wram.borrow();
                wram.read_u8(wram.main_view(), addr)
            }
            0x04 => self.mmio.read_u8(addr & 0x00FF_FFFF),
            0x06 => self.vram.read_u8(addr),
            _ => {
                tracing::warn!(addr, ?tag, "main CPU: read from unmapped address");
                0
            }
        }
    }

    pub fn write_u8(&mut self, addr: u32, tag: BusTag, value: u8) {
        if self.itcm.covers(addr) && matches!(tag, BusTag::Code | BusTag::Data) {
            self.itcm.write_u8(addr, value);
            return;
        }
        if matches!(tag, BusTag::Data) && self.dtcm.covers(addr) {
            self.dtcm.write_u8(addr, value);
            return;
        }
        match Self::region_selector(addr) {
            0x02 => self.main_ram.borrow_mut().write_u8(addr, value),
            0x03 => {
                let wram = self.wram.borrow();
                let view = wram.main_view();
                wram.write_u8(view, addr, value);
            }
            0x04 => self.mmio.write_u8(addr & 0x00FF_FFFF, value),
            0x06 => self.vram.write_u8(addr, value),
            _ => tracing::warn!(addr, ?tag, value, "main CPU: write to unmapped address"),
        }
    }

    pub fn read_u16(&self, addr: u32, tag: BusTag) -> u16 {
        let aligned = addr & !1;
        let value = if self.itcm.covers(aligned) && matches!(tag, BusTag::Code | BusTag::Data) {
            self.itcm.read_u16(aligned)
        } else if matches!(tag, BusTag::Data) && self.dtcm.covers(aligned) {
            self.dtcm.read_u16(aligned)
        } else {
            match Self::region_selector(aligned) {
                0x02 => self.main_ram.borrow().read_u16(aligned),
                0x03 => {
                    let wram = self.wram.borrow();
                    wram.read_u16(wram.main_view(), aligned)
                }
                0x04 => self.mmio.read_u16(aligned & 0x00FF_FFFF),
                0x06 => self.vram.read_u16(aligned),
                _ => {
                    tracing::warn!(addr, ?tag, "main CPU: read16 from unmapped address");
                    0
                }
            }
        };
        rotate_read_u16(value, addr)
    }

    pub fn write_u16(&mut self, addr: u32, tag: BusTag, value: u16) {
        let aligned = addr & !1;
        if self.itcm.covers(aligned) && matches!(tag, BusTag::Code | BusTag::Data) {
            self.itcm.write_u16(aligned, value);
            return;
        }
        if matches!(tag, BusTag::Data) && self.dtcm.covers(aligned) {
            self.dtcm.write_u16(aligned, value);
            return;
        }
        match Self::region_selector(aligned) {
            0x02 => self.main_ram.borrow_mut().write_u16(aligned, value),
            0x03 => {
                let wram = self.wram.borrow();
                let view = wram.main_view();
                wram.write_u16(view, aligned, value);
            }
            0x04 => self.mmio.write_u16(aligned & 0x00FF_FFFF, value),
            0x06 => self.vram.write_u16(aligned, value),
            _ => tracing::warn!(addr, ?tag, value, "main CPU: write16 to unmapped address"),
        }
    }

    pub fn read_u32(&self, addr: u32, tag: BusTag) -> u32 {
        let aligned = addr & !3;
        let value = if self.itcm.covers(aligned) && matches!(tag, BusTag::Code | BusTag::Data) {
            self.itcm.read_u32(aligned)
        } else if matches!(tag, BusTag::Data) && self.dtcm.covers(aligned) {
            self.dtcm.read_u32(aligned)
        } else {
            match Self::region_selector(aligned) {
                0x02 => self.main_ram.borrow().read_u32(aligned),
                0x03 => {
                    let wram = self.wram.borrow();
                    wram.read_u32(wram.main_view(), aligned)
                }
                0x04 => self.mmio.read_u32(aligned & 0x00FF_FFFF),
                0x06 => self.vram.read_u32(aligned),
                _ => {
                    tracing::warn!(addr, ?tag, "main CPU: read32 from unmapped address");
                    0
                }
            }
        };
        rotate_read_u32(value, addr)
    }

    pub fn write_u32(&mut self, addr: u32, tag: BusTag, value: u32) {
        let aligned = addr & !3;
        if self.itcm.covers(aligned) && matches!(tag, BusTag::Code | BusTag::Data) {
            self.itcm.write_u32(aligned, value);
            return;
        }
        if matches!(tag, BusTag::Data) && self.dtcm.covers(aligned) {
            self.dtcm.write_u32(aligned, value);
            return;
        }
        match Self::region_selector(aligned) {
            0x02 => self.main_ram.borrow_mut().write_u32(aligned, value),
            0x03 => {
                let wram = self.wram.borrow();
                let view = wram.main_view();
                wram.write_u32(view, aligned, value);
            }
            0x04 => self.mmio.write_u32(aligned & 0x00FF_FFFF, value),
            0x06 => self.vram.write_u32(aligned, value),
            _ => tracing::warn!(addr, ?tag, value, "main CPU: write32 to unmapped address"),
        }
    }
}

/// Per-CPU memory fabric for the audio CPU: private internal RAM, shared-WRAM view,
/// MMIO — no TCM, per §4.2's simpler audio-CPU decode.
pub struct AudioBus {
    internal_ram: Region,
    wram: Rc<RefCell<SharedWram>>,
    pub mmio: MmioRegistry,
}

impl AudioBus {
    pub fn new(wram: Rc<RefCell<SharedWram>>, mmio_window: u32) -> Self {
        Self {
            internal_ram: Region::new(AUDIO_INTERNAL_RAM_SIZE),
            wram,
            mmio: MmioRegistry::new(mmio_window),
        }
    }

    fn region_selector(addr: u32) -> u8 {
        (addr >> 24) as u8
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        match Self::region_selector(addr) {
            0x00 => self.internal_ram.read_u8(addr),
            0x03 => {
                let wram = self.wram.borrow();
                wram.read_u8(wram.audio_view(), addr)
            }
            0x04 => self.mmio.read_u8(addr & 0x00FF_FFFF),
            _ => {
                tracing::warn!(addr, "audio CPU: read from unmapped address");
                0
            }
        }
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        match Self::region_selector(addr) {
            0x00 => self.internal_ram.write_u8(addr, value),
            0x03 => {
                let wram = self.wram.borrow();
                let view = wram.audio_view();
                wram.write_u8(view, addr, value);
            }
            0x04 => self.mmio.write_u8(addr & 0x00FF_FFFF, value),
            _ => tracing::warn!(addr, value, "audio CPU: write to unmapped address"),
        }
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        let aligned = addr & !1;
        let value = match Self::region_selector(aligned) {
            0x00 => self.internal_ram.read_u16(aligned),
            0x03 => {
                let wram = self.wram.borrow();
                wram.read_u16(wram.audio_view(), aligned)
            }
            0x04 => self.mmio.read_u16(aligned & 0x00FF_FFFF),
            _ => {
                tracing::warn!(addr, "audio CPU: read16 from unmapped address");
                0
            }
        };
        rotate_read_u16(value, addr)
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) {
        let aligned = addr & !1;
        match Self::region_selector(aligned) {
            0x00 => self.internal_ram.write_u16(aligned, value),
            0x03 => {
                let wram = self.wram.borrow();
                let view = wram.audio_view();
                wram.write_u16(view, aligned, value);
            }
            0x04 => self.mmio.write_u16(aligned & 0x00FF_FFFF, value),
            _ => tracing::warn!(addr, value, "audio CPU: write16 to unmapped address"),
        }
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let aligned = addr & !3;
        let value = match Self::region_selector(aligned) {
            0x00 => self.internal_ram.read_u32(aligned),
            0x03 => {
                let wram = self.wram.borrow();
                wram.read_u32(wram.audio_view(), aligned)
            }
            0x04 => self.mmio.read_u32(aligned & 0x00FF_FFFF),
            _ => {
                tracing::warn!(addr, "audio CPU: read32 from unmapped address");
                0
            }
        };
        rotate_read_u32(value, addr)
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        let aligned = addr & !3;
        match Self::region_selector(aligned) {
            0x00 => self.internal_ram.write_u32(aligned, value),
            0x03 => {
                let wram = self.wram.borrow();
                let view = wram.audio_view();
                wram.write_u32(view, aligned, value);
            }
            0x04 => self.mmio.write_u32(aligned & 0x00FF_FFFF, value),
            _ => tracing::warn!(addr, value, "audio CPU: write32 to unmapped address"),
        }
    }
}
