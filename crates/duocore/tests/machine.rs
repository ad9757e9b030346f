use std::io::Write;

use duocore::{Config, Machine, NopExecutor, PixelProcessor, RunCollaborators, SampleResult, SampleSource};
use duocore_apu::Format;
use duocore_cart::Cartridge;

struct BlackPixelProcessor;

impl PixelProcessor for BlackPixelProcessor {
    fn render_scanline(&mut self, _vcount: u16, out_rgba_row: &mut [u8]) {
        out_rgba_row.fill(0);
    }
}

struct FinishedSampleSource;

impl SampleSource for FinishedSampleSource {
    fn next_sample(&mut self, _channel: usize, _src_address: u32, _format: Format) -> SampleResult {
        SampleResult::Finished
    }
}

fn write_header_only_cartridge(main_entry: u32, audio_entry: u32) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("create temp cartridge file");
    let mut header = [0u8; 0x40];
    header[0x20..0x24].copy_from_slice(&0u32.to_le_bytes()); // main.file_offset
    header[0x24..0x28].copy_from_slice(&main_entry.to_le_bytes()); // main.entrypoint
    header[0x28..0x2C].copy_from_slice(&main_entry.to_le_bytes()); // main.load_address
    header[0x2C..0x30].copy_from_slice(&0u32.to_le_bytes()); // main.size
    header[0x30..0x34].copy_from_slice(&0u32.to_le_bytes()); // audio.file_offset
    header[0x34..0x38].copy_from_slice(&audio_entry.to_le_bytes()); // audio.entrypoint
    header[0x38..0x3C].copy_from_slice(&audio_entry.to_le_bytes()); // audio.load_address
    header[0x3C..0x40].copy_from_slice(&0u32.to_le_bytes()); // audio.size
    file.write_all(&header).expect("write fixture header");
    file
}

#[test]
fn run_advances_by_the_requested_cycle_budget() {
    let fixture = write_header_only_cartridge(0x0200_0000, 0x0200_1000);
    let cart = Cartridge::load(fixture.path()).expect("load fixture cartridge");

    let mut machine = Machine::new(Config::default());
    machine.load_cartridge(&cart);

    let mut executor_main = NopExecutor;
    let mut executor_audio = NopExecutor;
    let mut pixel_main = BlackPixelProcessor;
    let mut pixel_audio = BlackPixelProcessor;
    let mut sample_source = FinishedSampleSource;
    let mut collab = RunCollaborators {
        executor_main: &mut executor_main,
        executor_audio: &mut executor_audio,
        pixel_main: &mut pixel_main,
        pixel_audio: &mut pixel_audio,
        sample_source: &mut sample_source,
    };

    let summary = machine.run(4096, &mut collab);

    assert!(summary.main_cycles_run >= 4096);
    // A full frame is a little over 280k cycles at this quantum; a short run shouldn't
    // complete one, which guards against the scanline/frame counters free-running.
    assert_eq!(summary.frames_completed, 0);
}

#[test]
fn run_completes_frames_over_a_full_frame_budget() {
    let fixture = write_header_only_cartridge(0x0200_0000, 0x0200_1000);
    let cart = Cartridge::load(fixture.path()).expect("load fixture cartridge");

    let mut machine = Machine::new(Config::default());
    machine.load_cartridge(&cart);

    let mut executor_main = NopExecutor;
    let mut executor_audio = NopExecutor;
    let mut pixel_main = BlackPixelProcessor;
    let mut pixel_audio = BlackPixelProcessor;
    let mut sample_source = FinishedSampleSource;
    let mut collab = RunCollaborators {
        executor_main: &mut executor_main,
        executor_audio: &mut executor_audio,
        pixel_main: &mut pixel_main,
        pixel_audio: &mut pixel_audio,
        sample_source: &mut sample_source,
    };

    // One line is 2130 cycles, 263 lines per frame: comfortably more than one frame.
    let summary = machine.run(2130 * 263 * 2, &mut collab);

    assert!(summary.frames_completed >= 1);
}
