use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

/// A header-only cartridge: every descriptor's offset/size is zero, which is a valid
/// (empty) load per `Cartridge::load`'s truncation check (0 + 0 <= file length).
fn write_empty_cartridge(path: &std::path::Path) {
    let mut file = std::fs::File::create(path).expect("create fixture cartridge");
    file.write_all(&[0u8; 0x40]).expect("write fixture header");
}

#[test]
fn boots_empty_cartridge_and_exits_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rom = dir.path().join("empty.bin");
    write_empty_cartridge(&rom);

    let target_dir = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../target"));
    let exe_name = format!("duocore{}", std::env::consts::EXE_SUFFIX);
    let debug_exe = target_dir.join("debug").join(&exe_name);
    let release_exe = target_dir.join("release").join(&exe_name);
    let exe = if debug_exe.exists() {
        debug_exe
    } else if release_exe.exists() {
        release_exe
    } else {
        panic!("expected duocore binary at {} or {}", debug_exe.display(), release_exe.display());
    };

    let output = Command::new(exe)
        .arg(&rom)
        .args(["--cycles", "2000"])
        .output()
        .expect("failed to run duocore CLI");

    assert!(
        output.status.success(),
        "duocore exited with {}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
}
