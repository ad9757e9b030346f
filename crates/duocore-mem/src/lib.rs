//! The memory-access fabric: address decoding, region routing, MMIO dispatch,
//! coprocessor-controlled tightly-coupled memories, and the shared-WRAM split, per §4.2
//! and §4.3.

pub mod bus;
pub mod mmio;
pub mod region;
pub mod tcm;
pub mod wram;

pub use bus::{AudioBus, BusTag, MainBus, AUDIO_INTERNAL_RAM_SIZE, DTCM_PHYSICAL_SIZE, ITCM_PHYSICAL_SIZE, MAIN_RAM_SIZE, VRAM_SIZE};
pub use mmio::{MmioError, MmioRegister, MmioRegistry, SharedRegister};
pub use region::Region;
pub use tcm::{Tcm, TcmDescriptor};
pub use wram::{SharedWram, WramView, SHARED_WRAM_SIZE};
