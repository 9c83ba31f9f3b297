//! ELF64 little-endian layout: constants, field offsets and bounds-checked readers.
//!
//! Nothing here reinterprets memory as a structure; every field is decoded from an
//! explicit offset and width and every read is checked against the image length.

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;

pub const EHDR_SIZE: usize = 64;
pub const E_PHOFF: usize = 32;
pub const E_PHENTSIZE: usize = 54;
pub const E_PHNUM: usize = 56;

pub const PHDR_SIZE: usize = 56;
pub const P_TYPE: usize = 0;
pub const P_OFFSET: usize = 8;
pub const P_VADDR: usize = 16;
pub const P_FILESZ: usize = 32;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

pub const DYN_SIZE: usize = 16;
pub const D_TAG: usize = 0;
pub const D_VAL: usize = 8;
pub const DT_NULL: i64 = 0;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;
pub const DT_VERSYM: i64 = 0x6fff_fff0;
pub const DT_VERDEF: i64 = 0x6fff_fffc;

pub const SYM_SIZE: usize = 24;
pub const ST_NAME: usize = 0;
pub const ST_INFO: usize = 4;
pub const ST_SHNDX: usize = 6;
pub const ST_VALUE: usize = 8;
pub const STT_NOTYPE: u8 = 0;
pub const STT_FUNC: u8 = 2;
pub const STB_GLOBAL: u8 = 1;
pub const STB_WEAK: u8 = 2;
pub const SHN_UNDEF: u16 = 0;

pub const VD_FLAGS: usize = 2;
pub const VD_NDX: usize = 4;
pub const VD_HASH: usize = 8;
pub const VD_AUX: usize = 12;
pub const VD_NEXT: usize = 16;
pub const VDA_NAME: usize = 0;
/// Version definition of the file itself
pub const VER_FLG_BASE: u16 = 0x1;
/// Version indices are 15 bits; the top bit marks hidden symbols.
pub const VERSYM_INDEX_MASK: u16 = 0x7fff;

/// GNU hash header: nbuckets, symoffset, bloom_size, bloom_shift
pub const GNU_HASH_HEADER_SIZE: usize = 16;
pub const GNU_BLOOM_WORD_SIZE: usize = 8;
/// SysV hash header: nbucket, nchain
pub const SYSV_HASH_HEADER_SIZE: usize = 8;

pub const AT_NULL: usize = 0;
pub const AT_SYSINFO_EHDR: usize = 33;

/// A borrowed ELF image with checked little-endian field access.
#[derive(Clone, Copy)]
pub struct ElfBytes<'a> {
    bytes: &'a [u8],
}

impl std::fmt::Debug for ElfBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElfBytes")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl<'a> ElfBytes<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.bytes.get(offset..end)?.try_into().ok()
    }

    pub fn u8_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(offset).copied()
    }

    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        self.array(offset).map(u16::from_le_bytes)
    }

    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        self.array(offset).map(u32::from_le_bytes)
    }

    pub fn u64_at(&self, offset: usize) -> Option<u64> {
        self.array(offset).map(u64::from_le_bytes)
    }

    pub fn i64_at(&self, offset: usize) -> Option<i64> {
        self.array(offset).map(i64::from_le_bytes)
    }

    /// The NUL-terminated string starting at `offset`, without the terminator.
    pub fn cstr_at(&self, offset: usize) -> Option<&'a [u8]> {
        let tail = self.bytes.get(offset..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        Some(&tail[..len])
    }

    /// Whether `len` bytes starting at `offset` lie inside the image.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.bytes.len())
    }

    pub fn header(&self) -> Option<FileHeader> {
        if self.array::<4>(0)? != ELF_MAGIC
            || self.u8_at(EI_CLASS)? != ELFCLASS64
            || self.u8_at(EI_DATA)? != ELFDATA2LSB
        {
            return None;
        }
        Some(FileHeader {
            phoff: usize::try_from(self.u64_at(E_PHOFF)?).ok()?,
            phentsize: usize::from(self.u16_at(E_PHENTSIZE)?),
            phnum: usize::from(self.u16_at(E_PHNUM)?),
        })
    }

    pub fn program_header(&self, header: &FileHeader, index: usize) -> Option<ProgramHeader> {
        let base = header
            .phoff
            .checked_add(index.checked_mul(header.phentsize)?)?;
        if header.phentsize < PHDR_SIZE || !self.contains(base, PHDR_SIZE) {
            return None;
        }
        Some(ProgramHeader {
            p_type: self.u32_at(base + P_TYPE)?,
            offset: self.u64_at(base + P_OFFSET)?,
            vaddr: self.u64_at(base + P_VADDR)?,
            filesz: self.u64_at(base + P_FILESZ)?,
        })
    }

    /// Tag and value of the dynamic entry at `offset`.
    pub fn dyn_entry(&self, offset: usize) -> Option<(i64, u64)> {
        Some((
            self.i64_at(offset.checked_add(D_TAG)?)?,
            self.u64_at(offset.checked_add(D_VAL)?)?,
        ))
    }

    pub fn symbol(&self, symtab: usize, index: usize) -> Option<Symbol> {
        let base = symtab.checked_add(index.checked_mul(SYM_SIZE)?)?;
        if !self.contains(base, SYM_SIZE) {
            return None;
        }
        Some(Symbol {
            name: self.u32_at(base + ST_NAME)?,
            info: self.u8_at(base + ST_INFO)?,
            shndx: self.u16_at(base + ST_SHNDX)?,
            value: self.u64_at(base + ST_VALUE)?,
        })
    }

    /// Element `index` of a `u32` array starting at `offset`.
    pub fn u32_element(&self, offset: usize, index: usize) -> Option<u32> {
        self.u32_at(offset.checked_add(index.checked_mul(4)?)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub phoff: usize,
    pub phentsize: usize,
    pub phnum: usize,
}

impl FileHeader {
    /// End of the program header table.
    pub fn table_end(&self) -> Option<usize> {
        self.phoff
            .checked_add(self.phnum.checked_mul(self.phentsize)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: u32,
    pub info: u8,
    pub shndx: u16,
    pub value: u64,
}

impl Symbol {
    pub fn bind(&self) -> u8 {
        self.info >> 4
    }

    pub fn kind(&self) -> u8 {
        self.info & 0xf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_omits_image_bytes() {
        let bytes = vec![0xabu8; 8192];
        let debug = format!("{:?}", ElfBytes::new(&bytes));
        assert_eq!(debug, "ElfBytes { len: 8192 }");
    }

    #[test]
    fn test_readers_are_bounds_checked() {
        let bytes = [1u8, 0, 0, 0, 2, 0, b'h', b'i', 0];
        let elf = ElfBytes::new(&bytes);
        assert_eq!(elf.u32_at(0), Some(1));
        assert_eq!(elf.u16_at(4), Some(2));
        assert_eq!(elf.u64_at(2), None);
        assert_eq!(elf.u32_at(usize::MAX - 1), None);
        assert_eq!(elf.cstr_at(6), Some(&b"hi"[..]));
        assert_eq!(elf.cstr_at(8), Some(&b""[..]));
        assert_eq!(elf.cstr_at(9), None);
        assert_eq!(elf.u32_element(0, 1), Some(0x6968_0002));
        assert!(elf.contains(0, 9));
        assert!(!elf.contains(1, 9));
        assert!(!elf.contains(usize::MAX, 2));
    }

    #[test]
    fn test_unterminated_string() {
        let elf = ElfBytes::new(b"abc");
        assert_eq!(elf.cstr_at(0), None);
    }

    #[test]
    fn test_header_rejects_non_elf64_le() {
        let mut bytes = vec![0u8; EHDR_SIZE];
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes[EI_CLASS] = ELFCLASS64;
        bytes[EI_DATA] = ELFDATA2LSB;
        bytes[E_PHOFF..E_PHOFF + 8].copy_from_slice(&64u64.to_le_bytes());
        bytes[E_PHENTSIZE..E_PHENTSIZE + 2].copy_from_slice(&56u16.to_le_bytes());
        bytes[E_PHNUM..E_PHNUM + 2].copy_from_slice(&3u16.to_le_bytes());
        let header = ElfBytes::new(&bytes).header().unwrap();
        assert_eq!(
            header,
            FileHeader {
                phoff: 64,
                phentsize: 56,
                phnum: 3
            }
        );
        assert_eq!(header.table_end(), Some(64 + 3 * 56));
        // the table itself is not inside this image
        assert_eq!(ElfBytes::new(&bytes).program_header(&header, 0), None);

        let mut big_endian = bytes.clone();
        big_endian[EI_DATA] = 2;
        assert_eq!(ElfBytes::new(&big_endian).header(), None);

        let mut elf32 = bytes.clone();
        elf32[EI_CLASS] = 1;
        assert_eq!(ElfBytes::new(&elf32).header(), None);

        bytes[0] = 0;
        assert_eq!(ElfBytes::new(&bytes).header(), None);
    }

    #[test]
    fn test_symbol_info() {
        let sym = Symbol {
            name: 0,
            info: (STB_WEAK << 4) | STT_FUNC,
            shndx: 1,
            value: 0,
        };
        assert_eq!(sym.bind(), STB_WEAK);
        assert_eq!(sym.kind(), STT_FUNC);
    }
}
