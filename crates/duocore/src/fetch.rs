//! Adapters that let the two `duocore-cpu` cores fetch opcodes from their respective
//! fabrics. `duocore-cpu::FetchBus` can't be implemented directly on `duocore_mem::MainBus`/
//! `AudioBus` from here without running afoul of the orphan rule, so each fabric gets a
//! thin newtype wrapper local to this crate instead.

use duocore_cpu::FetchBus;
use duocore_mem::{AudioBus, BusTag, MainBus};

pub struct MainFetch<'a>(pub &'a mut MainBus);

impl FetchBus for MainFetch<'_> {
    fn fetch_u16(&mut self, addr: u32) -> u16 {
        self.0.read_u16(addr, BusTag::Code)
    }

    fn fetch_u32(&mut self, addr: u32) -> u32 {
        self.0.read_u32(addr, BusTag::Code)
    }
}

pub struct AudioFetch<'a>(pub &'a mut AudioBus);

impl FetchBus for AudioFetch<'_> {
    fn fetch_u16(&mut self, addr: u32) -> u16 {
        self.0.read_u16(addr)
    }

    fn fetch_u32(&mut self, addr: u32) -> u32 {
        self.0.read_u32(addr)
    }
}
