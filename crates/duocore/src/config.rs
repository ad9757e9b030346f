//! Construction-time configuration, mirroring the small `Default`-constructed options
//! struct pattern used for fabric setup elsewhere in the workspace.

/// 1 audio cycle per `quantum_audio_cycles` main-CPU steps of the simulation loop; two main
/// cycles elapse per audio cycle at the default (tightest) quantum, per §5. Raising this
/// loosens CPU synchronization in exchange for fewer scheduler drains per host `run` call.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub quantum_audio_cycles: u64,
    pub initial_wram_split: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quantum_audio_cycles: 1,
            initial_wram_split: 0,
        }
    }
}
