//! System control coprocessor (main CPU only), per §4.4. Dispatches on `(op1, cn, cm,
//! op2)`; only `op1 == 0` does anything. TCM configuration is pushed to the memory
//! fabric as a one-way message on every write that changes it — the fabric never holds
//! a reference back into this type.

use duocore_mem::{BusTag, MainBus, TcmDescriptor};

const CONTROL_WRITABLE_MASK: u32 = 0x000F_F085;
const CONTROL_MANDATORY_SET: u32 = 0x78;
const MAIN_ID: u32 = 0x4105_9461;
const CACHE_TYPE: u32 = 0x0F0D_2112;

fn tcm_limit(size: u32, base: u32) -> u32 {
    let len: u64 = 512u64 << size.min(31);
    (base as u64 + len - 1) as u32
}

/// `(cn, cm, op2)` register state plus the derived TCM descriptors the fabric consumes.
pub struct Coprocessor {
    control: u32,
    dtcm_reg: u32,
    itcm_reg: u32,
    dtcm: TcmDescriptor,
    itcm: TcmDescriptor,
    exception_base: u32,
    wfi: bool,
}

impl Coprocessor {
    pub fn new(bus: &mut MainBus) -> Self {
        let mut cp = Self {
            control: 0,
            dtcm_reg: 0,
            itcm_reg: 0,
            dtcm: TcmDescriptor::disabled(),
            itcm: TcmDescriptor::disabled(),
            exception_base: 0,
            wfi: false,
        };
        cp.reset(bus);
        cp
    }

    /// Replicates a cold boot by writing the same reset constants the real coprocessor's
    /// own write handlers would see, so the derived fabric state stays consistent with a
    /// real cold-booted unit rather than being poked directly.
    pub fn reset(&mut self, bus: &mut MainBus) {
        self.write(0, 1, 0, 0, 0x0005_0000, bus);
        self.write(0, 9, 1, 0, 0x0080_000A, bus);
        self.write(0, 9, 1, 1, 0x0000_000C, bus);
        self.wfi = false;
    }

    pub fn exception_base(&self) -> u32 {
        self.exception_base
    }

    /// True once a `(7,0,4)` or `(7,8,2)` write has requested wait-for-interrupt. The CPU
    /// driver polls and clears this each step; the coprocessor has no reference back into
    /// the CPU to clear it itself.
    pub fn wfi_requested(&self) -> bool {
        self.wfi
    }

    pub fn clear_wfi(&mut self) {
        self.wfi = false;
    }

    pub fn read(&self, op1: u32, cn: u32, cm: u32, op2: u32) -> u32 {
        if op1 != 0 {
            return 0;
        }
        match (cn, cm, op2) {
            (0, 0, 0) => MAIN_ID,
            (0, 0, 1) => CACHE_TYPE,
            (1, 0, 0) => self.control,
            (9, 1, 0) => self.dtcm_reg,
            (9, 1, 1) => self.itcm_reg,
            _ => {
                tracing::warn!(cn, cm, op2, "coprocessor: unknown read");
                0
            }
        }
    }

    pub fn write(&mut self, op1: u32, cn: u32, cm: u32, op2: u32, value: u32, bus: &mut MainBus) {
        if op1 != 0 {
            return;
        }
        match (cn, cm, op2) {
            (1, 0, 0) => self.write_control(value, bus),
            (7, 0, 4) | (7, 8, 2) => self.wfi = true,
            (7, 5, _) => tracing::trace!(cn, cm, op2, "coprocessor: cache invalidate (no-op)"),
            (9, 1, 0) => self.write_dtcm_config(value, bus),
            (9, 1, 1) => self.write_itcm_config(value, bus),
            _ => tracing::warn!(cn, cm, op2, value, "coprocessor: unknown write"),
        }
    }

    fn write_control(&mut self, value: u32, bus: &mut MainBus) {
        self.control = (value & CONTROL_WRITABLE_MASK) | CONTROL_MANDATORY_SET;
        self.exception_base = if value & 0x2000 == 0 { 0x0000_0000 } else { 0xFFFF_0000 };

        self.dtcm.enabled = value & 0x1_0000 != 0;
        self.dtcm.readable = self.dtcm.enabled && value & 0x2_0000 == 0;
        bus.set_dtcm(self.dtcm);

        self.itcm.enabled = value & 0x4_0000 != 0;
        self.itcm.readable = self.itcm.enabled && value & 0x8_0000 == 0;
        bus.set_itcm(self.itcm);
    }

    fn write_dtcm_config(&mut self, value: u32, bus: &mut MainBus) {
        let size = (value >> 1) & 0x1F;
        if !(3..=23).contains(&size) {
            tracing::error!(size, "coprocessor: DTCM virtual size out of range, clamping");
        }
        let size = size.clamp(3, 23);
        let base = value & 0xFFFF_F000;
        self.dtcm_reg = value;
        self.dtcm.base = base;
        self.dtcm.limit = tcm_limit(size, base);
        bus.set_dtcm(self.dtcm);
    }

    fn write_itcm_config(&mut self, value: u32, bus: &mut MainBus) {
        let size = (value >> 1) & 0x1F;
        if !(3..=23).contains(&size) {
            tracing::error!(size, "coprocessor: ITCM virtual size out of range, clamping");
        }
        let size = size.clamp(3, 23);
        let mut value = value;
        let base = value & 0xFFFF_F000;
        if base != 0 {
            tracing::error!("coprocessor: ITCM base address cannot be moved, forcing to zero");
            value &= 0xFFF;
        }
        self.itcm_reg = value;
        self.itcm.base = 0;
        self.itcm.limit = tcm_limit(size, 0);
        bus.set_itcm(self.itcm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duocore_mem::{Region, SharedWram, MAIN_RAM_SIZE};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn new_bus() -> MainBus {
        let ram = Rc::new(RefCell::new(Region::new(MAIN_RAM_SIZE)));
        let wram = Rc::new(RefCell::new(SharedWram::new()));
        MainBus::new(ram, wram, 0x10000)
    }

    #[test]
    fn fixed_id_words_are_stable() {
        let mut bus = new_bus();
        let cp = Coprocessor::new(&mut bus);
        assert_eq!(cp.read(0, 0, 0, 0), 0x4105_9461);
        assert_eq!(cp.read(0, 0, 0, 1), 0x0F0D_2112);
    }

    #[test]
    fn reset_enables_both_tcms_with_low_exception_base() {
        let mut bus = new_bus();
        let cp = Coprocessor::new(&mut bus);
        assert_eq!(cp.exception_base(), 0);
        // Reset enables DTCM and ITCM; a write just inside DTCM's reset window should
        // now be visible on the data bus.
        bus.write_u8(0x0080_0000, BusTag::Data, 0xAB);
        assert_eq!(bus.read_u8(0x0080_0000, BusTag::Data), 0xAB);
    }

    #[test]
    fn control_write_masks_and_forces_mandatory_bits() {
        let mut bus = new_bus();
        let mut cp = Coprocessor::new(&mut bus);
        cp.write(0, 1, 0, 0, 0xFFFF_FFFF, &mut bus);
        assert_eq!(cp.read(0, 1, 0, 0), (0xFFFF_FFFFu32 & CONTROL_WRITABLE_MASK) | CONTROL_MANDATORY_SET);
        assert_eq!(cp.exception_base(), 0xFFFF_0000);
    }

    #[test]
    fn wfi_latch_sets_on_either_encoding_and_clears_on_demand() {
        let mut bus = new_bus();
        let mut cp = Coprocessor::new(&mut bus);
        assert!(!cp.wfi_requested());
        cp.write(0, 7, 0, 4, 0, &mut bus);
        assert!(cp.wfi_requested());
        cp.clear_wfi();
        assert!(!cp.wfi_requested());
        cp.write(0, 7, 8, 2, 0, &mut bus);
        assert!(cp.wfi_requested());
    }

    #[test]
    fn itcm_base_is_pinned_to_zero_even_if_requested_otherwise() {
        let mut bus = new_bus();
        let mut cp = Coprocessor::new(&mut bus);
        cp.write(0, 9, 1, 1, 0x1000_0006, &mut bus); // base=0x1000, size=3
        assert_eq!(cp.read(0, 9, 1, 1) & 0xFFFF_F000, 0);
    }

    #[test]
    fn unknown_register_read_is_zero_and_write_is_ignored() {
        let mut bus = new_bus();
        let mut cp = Coprocessor::new(&mut bus);
        assert_eq!(cp.read(0, 15, 15, 7), 0);
        cp.write(0, 15, 15, 7, 0xDEAD_BEEF, &mut bus); // must not panic
    }

    #[test]
    fn op1_nonzero_is_always_a_no_op() {
        let mut bus = new_bus();
        let mut cp = Coprocessor::new(&mut bus);
        assert_eq!(cp.read(1, 0, 0, 0), 0);
        cp.write(1, 1, 0, 0, 0xFFFF_FFFF, &mut bus);
        assert_eq!(cp.read(0, 1, 0, 0), (0x0005_0000u32 & CONTROL_WRITABLE_MASK) | CONTROL_MANDATORY_SET);
    }
}
