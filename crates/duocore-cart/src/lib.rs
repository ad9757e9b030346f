//! Cartridge loader, per §6/§4.12. Parses the fixed little-endian header and copies the
//! two CPU binaries into their respective fabrics; CPU reset/entrypoint wiring is left
//! to the caller (`duocore-cart` has no dependency on the CPU core).

use std::fs;
use std::path::Path;

use duocore_mem::{AudioBus, BusTag, MainBus};
use thiserror::Error;

const HEADER_SIZE: usize = 0x40;

#[derive(Debug, Error)]
pub enum CartError {
    #[error("failed to read cartridge file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cartridge file is {len} bytes, shorter than the {HEADER_SIZE}-byte header")]
    TooShort { len: usize },
    #[error("{descriptor} binary declares offset {file_offset:#x} + size {size:#x}, past end of file ({file_len:#x} bytes)")]
    Truncated {
        descriptor: &'static str,
        file_offset: u32,
        size: u32,
        file_len: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryDescriptor {
    pub file_offset: u32,
    pub entrypoint: u32,
    pub load_address: u32,
    pub size: u32,
}

impl BinaryDescriptor {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            file_offset: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            entrypoint: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            load_address: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CartridgeHeader {
    pub title: [u8; 12],
    pub game_code: [u8; 4],
    pub maker_code: [u8; 2],
    pub unit_code: u8,
    pub encryption_seed: u8,
    pub capacity: u8,
    pub region: u8,
    pub version: u8,
    pub autostart: u8,
    pub main: BinaryDescriptor,
    pub audio: BinaryDescriptor,
}

impl CartridgeHeader {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            title: bytes[0x00..0x0C].try_into().unwrap(),
            game_code: bytes[0x0C..0x10].try_into().unwrap(),
            maker_code: bytes[0x10..0x12].try_into().unwrap(),
            unit_code: bytes[0x12],
            encryption_seed: bytes[0x13],
            capacity: bytes[0x14],
            region: bytes[0x1D],
            version: bytes[0x1E],
            autostart: bytes[0x1F],
            main: BinaryDescriptor::parse(&bytes[0x20..0x30]),
            audio: BinaryDescriptor::parse(&bytes[0x30..0x40]),
        }
    }
}

/// The CPUs' initial program counters, handed back by `install` so the (not yet built)
/// CPU core can reset into them. `Cartridge` has no way to reach the CPU state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints {
    pub main: u32,
    pub audio: u32,
}

pub struct Cartridge {
    pub header: CartridgeHeader,
    data: Vec<u8>,
}

impl Cartridge {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CartError> {
        let data = fs::read(path)?;
        if data.len() < HEADER_SIZE {
            return Err(CartError::TooShort { len: data.len() });
        }
        let header = CartridgeHeader::parse(&data);

        for (descriptor, name) in [(&header.main, "main"), (&header.audio, "audio")] {
            let end = descriptor.file_offset as u64 + descriptor.size as u64;
            if end > data.len() as u64 {
                return Err(CartError::Truncated {
                    descriptor: name,
                    file_offset: descriptor.file_offset,
                    size: descriptor.size,
                    file_len: data.len(),
                });
            }
        }

        Ok(Self { header, data })
    }

    /// Copies the main and audio binaries into their respective fabrics at their
    /// declared load addresses. Returns the entrypoints the caller should reset each CPU
    /// into.
    pub fn install(&self, main_bus: &mut MainBus, audio_bus: &mut AudioBus) -> EntryPoints {
        let main_slice = self.slice(&self.header.main);
        for (i, byte) in main_slice.iter().enumerate() {
            main_bus.write_u8(self.header.main.load_address.wrapping_add(i as u32), BusTag::Data, *byte);
        }

        let audio_slice = self.slice(&self.header.audio);
        for (i, byte) in audio_slice.iter().enumerate() {
            audio_bus.write_u8(self.header.audio.load_address.wrapping_add(i as u32), *byte);
        }

        tracing::info!(
            main_entry = self.header.main.entrypoint,
            audio_entry = self.header.audio.entrypoint,
            "cartridge installed"
        );

        EntryPoints {
            main: self.header.main.entrypoint,
            audio: self.header.audio.entrypoint,
        }
    }

    fn slice(&self, descriptor: &BinaryDescriptor) -> &[u8] {
        let start = descriptor.file_offset as usize;
        let end = start + descriptor.size as usize;
        &self.data[start..end]
    }
}

/// A flat backup-chip blob up to 512 KiB, per §6's "Save file" / §4.13. Not a hardware
/// block; owned by the top-level driver and handed to the (external) backup SPI device
/// as a byte slice.
pub struct SaveBackup {
    data: Vec<u8>,
}

pub const SAVE_BACKUP_MAX_SIZE: usize = 512 * 1024;

impl SaveBackup {
    pub fn empty(size: usize) -> Self {
        Self {
            data: vec![0u8; size.min(SAVE_BACKUP_MAX_SIZE)],
        }
    }

    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let mut data = fs::read(path)?;
        data.truncate(SAVE_BACKUP_MAX_SIZE);
        Ok(Self { data })
    }

    pub fn persist(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        fs::write(path, &self.data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duocore_mem::{Region, SharedWram, MAIN_RAM_SIZE};
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    fn build_image(main_code: &[u8], audio_code: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        let main_offset = HEADER_SIZE as u32;
        let audio_offset = main_offset + main_code.len() as u32;

        bytes[0x20..0x24].copy_from_slice(&main_offset.to_le_bytes());
        bytes[0x24..0x28].copy_from_slice(&0x0200_0000u32.to_le_bytes()); // entrypoint
        bytes[0x28..0x2C].copy_from_slice(&0x0200_0000u32.to_le_bytes()); // load address
        bytes[0x2C..0x30].copy_from_slice(&(main_code.len() as u32).to_le_bytes());

        bytes[0x30..0x34].copy_from_slice(&audio_offset.to_le_bytes());
        bytes[0x34..0x38].copy_from_slice(&0x0000_0000u32.to_le_bytes());
        bytes[0x38..0x3C].copy_from_slice(&0x0000_0000u32.to_le_bytes());
        bytes[0x3C..0x40].copy_from_slice(&(audio_code.len() as u32).to_le_bytes());

        bytes.extend_from_slice(main_code);
        bytes.extend_from_slice(audio_code);
        bytes
    }

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn parses_header_and_installs_binaries_at_their_load_addresses() {
        let image = build_image(&[0xAA, 0xBB, 0xCC, 0xDD], &[0x11, 0x22]);
        let temp = write_temp(&image);
        let cart = Cartridge::load(temp.path()).unwrap();

        assert_eq!(cart.header.main.load_address, 0x0200_0000);
        assert_eq!(cart.header.main.size, 4);

        let ram = Rc::new(RefCell::new(Region::new(MAIN_RAM_SIZE)));
        let wram = Rc::new(RefCell::new(SharedWram::new()));
        let mut main_bus = MainBus::new(ram, wram.clone(), 0x10000);
        let mut audio_bus = AudioBus::new(wram, 0x10000);

        let entries = cart.install(&mut main_bus, &mut audio_bus);
        assert_eq!(entries.main, 0x0200_0000);
        assert_eq!(main_bus.read_u8(0x0200_0000, BusTag::Data), 0xAA);
        assert_eq!(main_bus.read_u8(0x0200_0003, BusTag::Data), 0xDD);
    }

    #[test]
    fn file_shorter_than_header_is_rejected() {
        let temp = write_temp(&[0u8; 0x10]);
        let err = Cartridge::load(temp.path()).unwrap_err();
        assert!(matches!(err, CartError::TooShort { len: 0x10 }));
    }

    #[test]
    fn declared_size_past_eof_is_rejected() {
        let mut image = build_image(&[0x01, 0x02], &[]);
        image.truncate(image.len() - 1); // chop off the last declared byte
        let temp = write_temp(&image);
        let err = Cartridge::load(temp.path()).unwrap_err();
        assert!(matches!(err, CartError::Truncated { descriptor: "main", .. }));
    }

    #[test]
    fn save_backup_round_trips_through_a_file() {
        let mut backup = SaveBackup::empty(256);
        backup.as_mut_slice()[10] = 0x42;
        let path = std::env::temp_dir().join(format!("duocore-save-test-{}.sav", std::process::id()));
        backup.persist(&path).unwrap();

        let reloaded = SaveBackup::load(&path).unwrap();
        assert_eq!(reloaded.as_slice()[10], 0x42);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_backup_load_truncates_to_the_512kib_cap() {
        let oversized = vec![0xFFu8; SAVE_BACKUP_MAX_SIZE + 100];
        let path = std::env::temp_dir().join(format!("duocore-save-oversized-{}.sav", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&oversized).unwrap();

        let loaded = SaveBackup::load(&path).unwrap();
        assert_eq!(loaded.as_slice().len(), SAVE_BACKUP_MAX_SIZE);
        let _ = std::fs::remove_file(&path);
    }
}
