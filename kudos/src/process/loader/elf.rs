//! ELF32 executable parsing.
//!
//! Only what the loader needs: the executable header and the program
//! headers, little-endian, 32-bit. Section headers are linker business and
//! are ignored here.

/// Loadable segment.
pub const PT_LOAD: u32 = 1;
/// Dynamic linking info; unsupported.
pub const PT_DYNAMIC: u32 = 2;
/// Dynamic loader name; unsupported.
pub const PT_INTERP: u32 = 3;
/// Reserved; unsupported.
pub const PT_SHLIB: u32 = 5;

/// Segment is writable.
pub const PF_W: u32 = 2;

/// Size of the ELF32 executable header.
pub const EHDR_SIZE: usize = 52;
/// Size of one ELF32 program header.
pub const PHDR_SIZE: usize = 32;

/// The fields of the executable header the loader acts on.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub entry: u32,
    pub phoff: u32,
    pub phnum: u16,
}

impl ElfHeader {
    /// Validates and parses an executable header.
    ///
    /// Accepts exactly the executables this kernel runs: 32-bit,
    /// little-endian, `ET_EXEC` for the 386, with sane program-header
    /// geometry.
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> Option<Self> {
        if &bytes[0..4] != b"\x7fELF" {
            return None;
        }
        let class = bytes[4];
        let data = bytes[5];
        let ident_version = bytes[6];
        if class != 1 || data != 1 || ident_version != 1 {
            return None;
        }
        let e_type = rd16(bytes, 16);
        let e_machine = rd16(bytes, 18);
        let e_version = rd32(bytes, 20);
        let e_phentsize = rd16(bytes, 42);
        let e_phnum = rd16(bytes, 44);
        if e_type != 2 || e_machine != 3 || e_version != 1 {
            return None;
        }
        if e_phentsize as usize != PHDR_SIZE || e_phnum > 1024 {
            return None;
        }
        Some(ElfHeader {
            entry: rd32(bytes, 24),
            phoff: rd32(bytes, 28),
            phnum: e_phnum,
        })
    }
}

/// One program header.
#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8; PHDR_SIZE]) -> Self {
        ProgramHeader {
            p_type: rd32(bytes, 0),
            p_offset: rd32(bytes, 4),
            p_vaddr: rd32(bytes, 8),
            p_filesz: rd32(bytes, 16),
            p_memsz: rd32(bytes, 20),
            p_flags: rd32(bytes, 24),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }
}

fn rd16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn rd32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}
