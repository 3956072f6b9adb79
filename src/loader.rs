//! Kernel image loading: flat binaries and MIPS32 ELF executables.
//!
//! A flat image is copied to physical `0x00010000` and entered at virtual
//! `0x80010000`. An ELF file must be a 32-bit MIPS executable whose byte
//! order matches the simulated machine; loadable segments must live in
//! the unmapped kernel segments (`0x80000000..0xB0000000`, not crossing
//! the kseg0/kseg1 seam), fit in physical memory, and are zero-padded to
//! their memory size as the ELF spec requires. The entry point comes from
//! the header.
//!
//! A file without the ELF magic is treated as a flat image; anything the
//! loader rejects aborts the boot command, never the simulator.

use std::path::Path;

use crate::bits::{self, Endianness};
use crate::machine::Machine;
use crate::memory::map;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_MIPS: u16 = 8;
const EM_MIPS_RS3_LE: u16 = 10;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_NOTE: u32 = 4;
const PT_PHDR: u32 = 6;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("couldn't open file [{0}]")]
    Open(String),
    #[error("image does not fit into physical memory")]
    TooBig,
    #[error("ELF: data is not MIPS 32-bit {0}")]
    WrongFormat(&'static str),
    #[error("ELF: invalid version")]
    BadVersion,
    #[error("ELF: not an executable file")]
    NotExecutable,
    #[error("ELF: no program headers")]
    NoProgramHeaders,
    #[error("ELF: truncated file")]
    Truncated,
    #[error("ELF: invalid virtual address {0:#010x}")]
    BadSegmentAddress(u32),
    #[error("ELF: program segment does not fit into its memory segment")]
    SegmentOverflow,
    #[error("ELF: segment does not fit into physical memory")]
    SegmentTooBig,
    #[error("ELF: detected dynamic linking information")]
    DynamicLinking,
    #[error("ELF: detected interpreter request")]
    InterpreterRequest,
}

/// Load a kernel image into the machine, returning the entry point.
pub fn load_image(machine: &mut Machine, path: &Path) -> Result<u32, LoadError> {
    let bytes = std::fs::read(path)
        .map_err(|_| LoadError::Open(path.display().to_string()))?;

    if bytes.len() >= 4 && bytes[0..4] == ELF_MAGIC {
        load_elf(machine, &bytes)
    } else {
        load_flat(machine, &bytes)
    }
}

fn load_flat(machine: &mut Machine, bytes: &[u8]) -> Result<u32, LoadError> {
    machine
        .bus
        .mem
        .store_direct(map::STARTUP_PADDR, bytes)
        .map_err(|_| LoadError::TooBig)?;
    Ok(map::STARTUP_PC)
}

fn field16(endian: Endianness, bytes: &[u8], offset: usize) -> Result<u16, LoadError> {
    let slice = bytes.get(offset..offset + 2).ok_or(LoadError::Truncated)?;
    Ok(bits::read16(endian, [slice[0], slice[1]]))
}

fn field32(endian: Endianness, bytes: &[u8], offset: usize) -> Result<u32, LoadError> {
    let slice = bytes.get(offset..offset + 4).ok_or(LoadError::Truncated)?;
    Ok(bits::read32(endian, [slice[0], slice[1], slice[2], slice[3]]))
}

fn load_elf(machine: &mut Machine, bytes: &[u8]) -> Result<u32, LoadError> {
    let endian = machine.bus.endian();

    // The file's byte order and machine must match the simulated ones.
    let (want_data, want_machine, label) = if endian.is_big() {
        (ELFDATA2MSB, EM_MIPS, "big-endian")
    } else {
        (ELFDATA2LSB, EM_MIPS_RS3_LE, "little-endian")
    };
    if bytes.len() < 52 {
        return Err(LoadError::Truncated);
    }
    if bytes[4] != ELFCLASS32
        || bytes[5] != want_data
        || field16(endian, bytes, 18)? != want_machine
    {
        return Err(LoadError::WrongFormat(label));
    }
    if bytes[6] as u32 != EV_CURRENT || field32(endian, bytes, 20)? != EV_CURRENT {
        return Err(LoadError::BadVersion);
    }
    if field16(endian, bytes, 16)? != ET_EXEC {
        return Err(LoadError::NotExecutable);
    }

    let phnum = field16(endian, bytes, 44)?;
    if phnum == 0 {
        return Err(LoadError::NoProgramHeaders);
    }
    let phoff = field32(endian, bytes, 28)? as usize;
    let phentsize = field16(endian, bytes, 42)? as usize;

    let entry = field32(endian, bytes, 24)?;
    println!("ELF: entrypoint=#{entry:08x}");

    let physmem = machine.bus.mem.size();

    for index in 0..phnum as usize {
        let ph = phoff + index * phentsize;
        let p_type = field32(endian, bytes, ph)?;
        match p_type {
            0 | PT_NOTE | PT_PHDR => {
                println!("ELF: ignoring program header type {p_type}");
            }
            PT_LOAD => {
                let offset = field32(endian, bytes, ph + 4)?;
                let vaddr = field32(endian, bytes, ph + 8)?;
                let filesz = field32(endian, bytes, ph + 16)?;
                let memsz = field32(endian, bytes, ph + 20)?;
                println!(
                    "ELF: load: offset=#{offset:08x} vaddr=#{vaddr:08x} \
                     size=#{filesz:08x} memsize=#{memsz:08x}"
                );

                // Segments must live in the unmapped kernel segments;
                // the I/O area begins at 0xB0000000. Sizes are checked in
                // 64 bits so a pathological header cannot wrap.
                if !(0x8000_0000..0xb000_0000).contains(&vaddr) {
                    return Err(LoadError::BadSegmentAddress(vaddr));
                }
                let end = vaddr as u64 + memsz as u64;
                if (vaddr >= 0xa000_0000 && end > 0xb000_0000)
                    || (vaddr < 0xa000_0000 && end > 0xa000_0000)
                {
                    return Err(LoadError::SegmentOverflow);
                }
                let paddr = if vaddr < 0xa000_0000 {
                    vaddr - 0x8000_0000
                } else {
                    vaddr - 0xa000_0000
                };
                if paddr >= physmem || paddr as u64 + memsz as u64 > physmem as u64 {
                    return Err(LoadError::SegmentTooBig);
                }

                // The ELF spec requires the bss tail to be zeroed.
                let _ = machine.bus.mem.zero_range(paddr, memsz);
                let data = bytes
                    .get(offset as usize..offset as usize + filesz as usize)
                    .ok_or(LoadError::Truncated)?;
                let _ = machine.bus.mem.store_direct(paddr, data);
            }
            PT_DYNAMIC => return Err(LoadError::DynamicLinking),
            PT_INTERP => return Err(LoadError::InterpreterRequest),
            _ => {
                // Extra headers are tolerated.
            }
        }
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::Endianness;
    use std::io::Write;

    fn machine(endian: Endianness) -> Machine {
        let mut machine = Machine::new(256, 1, 100_000, 4, endian);
        machine.bus.init_io();
        machine
    }

    /// Assemble a minimal big-endian MIPS ELF with one PT_LOAD segment.
    fn tiny_elf(endian: Endianness, entry: u32, vaddr: u32, payload: &[u8]) -> Vec<u8> {
        let w16 = |v: u16| bits::write16(endian, v);
        let w32 = |v: u32| bits::write32(endian, v);

        let mut elf = Vec::new();
        elf.extend_from_slice(&ELF_MAGIC);
        elf.push(ELFCLASS32);
        elf.push(if endian.is_big() { ELFDATA2MSB } else { ELFDATA2LSB });
        elf.push(1); // EI_VERSION
        elf.extend_from_slice(&[0; 9]); // padding to 16
        elf.extend_from_slice(&w16(ET_EXEC));
        elf.extend_from_slice(&w16(if endian.is_big() { EM_MIPS } else { EM_MIPS_RS3_LE }));
        elf.extend_from_slice(&w32(EV_CURRENT));
        elf.extend_from_slice(&w32(entry));
        elf.extend_from_slice(&w32(52)); // phoff: right after the header
        elf.extend_from_slice(&w32(0)); // shoff
        elf.extend_from_slice(&w32(0)); // flags
        elf.extend_from_slice(&w16(52)); // ehsize
        elf.extend_from_slice(&w16(32)); // phentsize
        elf.extend_from_slice(&w16(1)); // phnum
        elf.extend_from_slice(&w16(0)); // shentsize
        elf.extend_from_slice(&w16(0)); // shnum
        elf.extend_from_slice(&w16(0)); // shstrndx

        let data_offset = 52 + 32;
        elf.extend_from_slice(&w32(PT_LOAD));
        elf.extend_from_slice(&w32(data_offset));
        elf.extend_from_slice(&w32(vaddr));
        elf.extend_from_slice(&w32(vaddr)); // paddr, unused
        elf.extend_from_slice(&w32(payload.len() as u32));
        elf.extend_from_slice(&w32(payload.len() as u32 + 16)); // memsz > filesz
        elf.extend_from_slice(&w32(0)); // flags
        elf.extend_from_slice(&w32(0)); // align

        elf.extend_from_slice(payload);
        elf
    }

    #[test]
    fn test_flat_image() {
        let mut machine = machine(Endianness::Big);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0x34, 0x02, 0x12, 0x34])
            .unwrap();

        let entry = load_image(&mut machine, &path).unwrap();
        assert_eq!(entry, map::STARTUP_PC);
        assert_eq!(machine.bus.mem.load32(map::STARTUP_PADDR), 0x3402_1234);
    }

    #[test]
    fn test_flat_image_too_big() {
        let mut machine = machine(Endianness::Big);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        let size = machine.bus.mem.size() as usize;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&vec![0u8; size])
            .unwrap();
        assert!(matches!(
            load_image(&mut machine, &path),
            Err(LoadError::TooBig)
        ));
    }

    #[test]
    fn test_elf_roundtrip_both_orders() {
        for endian in [Endianness::Big, Endianness::Little] {
            let mut machine = machine(endian);
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("kernel.elf");
            let elf = tiny_elf(endian, 0x8002_0000, 0x8002_0000, &[1, 2, 3, 4]);
            std::fs::write(&path, elf).unwrap();

            let entry = load_image(&mut machine, &path).unwrap();
            assert_eq!(entry, 0x8002_0000);
            let mut data = [0u8; 4];
            machine.bus.mem.read_direct(0x0002_0000, &mut data).unwrap();
            assert_eq!(data, [1, 2, 3, 4]);
            // The memsz tail beyond filesz is zeroed.
            assert_eq!(machine.bus.mem.load32(0x0002_0004), 0);
        }
    }

    #[test]
    fn test_elf_wrong_endianness_rejected() {
        let mut machine = machine(Endianness::Big);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.elf");
        let elf = tiny_elf(Endianness::Little, 0x8002_0000, 0x8002_0000, &[1]);
        std::fs::write(&path, elf).unwrap();
        assert!(matches!(
            load_image(&mut machine, &path),
            Err(LoadError::WrongFormat(_))
        ));
    }

    #[test]
    fn test_elf_bad_segment_address() {
        let mut machine = machine(Endianness::Big);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.elf");
        // A user-space segment address is rejected.
        let elf = tiny_elf(Endianness::Big, 0x0040_0000, 0x0040_0000, &[1]);
        std::fs::write(&path, elf).unwrap();
        assert!(matches!(
            load_image(&mut machine, &path),
            Err(LoadError::BadSegmentAddress(_))
        ));
    }

    #[test]
    fn test_elf_segment_past_physical_memory() {
        let mut machine = machine(Endianness::Big);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.elf");
        // In-range virtual address but beyond the configured 1 MiB.
        let elf = tiny_elf(Endianness::Big, 0x8070_0000, 0x8070_0000, &[1]);
        std::fs::write(&path, elf).unwrap();
        assert!(matches!(
            load_image(&mut machine, &path),
            Err(LoadError::SegmentTooBig)
        ));
    }
}
