//! Symbol resolution in the kernel-provided vDSO image.
//!
//! The vDSO is an ELF shared object the kernel maps into every process. Its base
//! address arrives through the `AT_SYSINFO_EHDR` entry of the auxiliary vector.
//! [`VdsoImage`] parses the dynamic section of such an image once and then looks
//! exported functions up through either the SysV (`DT_HASH`) or the GNU
//! (`DT_GNU_HASH`) hash table, honouring symbol versions when the image has them.
//!
//! This is not a loader: nothing is relocated, and only the single image the kernel
//! already mapped is ever inspected.

mod elf;
mod hash;

pub use hash::{elf_hash, gnu_hash};
use {
    crate::{config::NumaConfig, error::NumaError},
    elf::*,
    log::debug,
    std::{collections::HashMap, fs, mem::size_of},
    thiserror::Error,
};

/// The vDSO getcpu routine.
pub const GETCPU_SYMBOL: &str = "__vdso_getcpu";

/// Exports resolved once at startup.
const KNOWN_SYMBOLS: [&str; 5] = [
    GETCPU_SYMBOL,
    "__vdso_clock_gettime",
    "__vdso_gettimeofday",
    "__vdso_time",
    "__vdso_clock_getres",
];

/// Upper bound for an image whose size is derived from its own headers.
const MAX_IMAGE_SIZE: usize = 1 << 20;

/// A symbol version definition to match against `DT_VERDEF`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionKey {
    pub name: &'static str,
    pub hash: u32,
}

impl VersionKey {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            hash: elf_hash(name.as_bytes()),
        }
    }
}

/// Version every Linux vDSO symbol of interest is defined under.
pub const LINUX_2_6: VersionKey = VersionKey::new("LINUX_2.6");

/// Reasons an image cannot be used. Never surfaced past this module.
#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum VdsoError {
    #[error("not a little-endian ELF64 image")]
    NotElf,
    #[error("program header {0} is truncated")]
    TruncatedProgramHeader(usize),
    #[error("no PT_LOAD segment")]
    MissingLoadSegment,
    #[error("no PT_DYNAMIC segment")]
    MissingDynamic,
    #[error("dynamic section is not terminated by DT_NULL")]
    UnterminatedDynamic,
    #[error("no DT_STRTAB entry")]
    MissingStringTable,
    #[error("no DT_SYMTAB entry")]
    MissingSymbolTable,
    #[error("neither DT_HASH nor DT_GNU_HASH is present")]
    MissingHashTable,
    #[error("hash table is truncated or has no buckets")]
    BadHashTable,
    #[error("address {0:#x} lies outside the image")]
    AddressOutOfImage(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HashTable {
    Sysv {
        nbucket: u32,
        nchain: u32,
        buckets: usize,
        chain: usize,
    },
    Gnu {
        nbucket: u32,
        symoffset: u32,
        buckets: usize,
        chain: usize,
    },
}

/// A parsed vDSO image. All table locations are offsets into the borrowed bytes.
#[derive(Clone, Copy, Debug)]
pub struct VdsoImage<'a> {
    elf: ElfBytes<'a>,
    /// Runtime address of virtual address 0
    load_offset: usize,
    symtab: usize,
    strtab: usize,
    hash: HashTable,
    versym: Option<usize>,
    /// 15-bit version index symbols must carry, if version checking is active
    version: Option<u16>,
}

impl<'a> VdsoImage<'a> {
    /// Parses `bytes`, the image mapped at runtime address `base`, matching
    /// symbol versions against [`LINUX_2_6`].
    pub fn parse(bytes: &'a [u8], base: usize) -> Option<Self> {
        Self::parse_versioned(bytes, base, &LINUX_2_6)
    }

    /// Like [`VdsoImage::parse`], with an explicit required version.
    pub fn parse_versioned(bytes: &'a [u8], base: usize, version: &VersionKey) -> Option<Self> {
        Self::try_parse(bytes, base, version)
            .map_err(|err| debug!("vDSO image at {base:#x} is unusable: {err}"))
            .ok()
    }

    fn try_parse(bytes: &'a [u8], base: usize, version: &VersionKey) -> Result<Self, VdsoError> {
        let elf = ElfBytes::new(bytes);
        let header = elf.header().ok_or(VdsoError::NotElf)?;

        // The first loadable segment fixes the vaddr -> file offset bias; the
        // dynamic segment locates everything else.
        let mut bias = None;
        let mut dynamic = None;
        for index in 0..header.phnum {
            let phdr = elf
                .program_header(&header, index)
                .ok_or(VdsoError::TruncatedProgramHeader(index))?;
            match phdr.p_type {
                PT_LOAD if bias.is_none() => bias = Some(phdr.offset.wrapping_sub(phdr.vaddr)),
                PT_DYNAMIC => dynamic = Some(phdr.offset),
                _ => {}
            }
        }
        let bias = bias.ok_or(VdsoError::MissingLoadSegment)?;
        let dynamic = dynamic.ok_or(VdsoError::MissingDynamic)?;
        let dynamic = usize::try_from(dynamic).map_err(|_| VdsoError::AddressOutOfImage(dynamic))?;

        let to_offset = |vaddr: u64| {
            let offset = vaddr.wrapping_add(bias);
            usize::try_from(offset)
                .ok()
                .filter(|&offset| elf.contains(offset, 1))
                .ok_or(VdsoError::AddressOutOfImage(vaddr))
        };

        let mut strtab = None;
        let mut symtab = None;
        let mut sysv_hash = None;
        let mut gnu_hash = None;
        let mut versym = None;
        let mut verdef = None;
        let mut entry = dynamic;
        loop {
            let (tag, value) = elf
                .dyn_entry(entry)
                .ok_or(VdsoError::UnterminatedDynamic)?;
            match tag {
                DT_NULL => break,
                DT_STRTAB => strtab = Some(to_offset(value)?),
                DT_SYMTAB => symtab = Some(to_offset(value)?),
                DT_HASH => sysv_hash = Some(to_offset(value)?),
                DT_GNU_HASH => gnu_hash = Some(to_offset(value)?),
                DT_VERSYM => versym = Some(to_offset(value)?),
                DT_VERDEF => verdef = Some(to_offset(value)?),
                _ => {}
            }
            entry = entry
                .checked_add(DYN_SIZE)
                .ok_or(VdsoError::UnterminatedDynamic)?;
        }

        let strtab = strtab.ok_or(VdsoError::MissingStringTable)?;
        let symtab = symtab.ok_or(VdsoError::MissingSymbolTable)?;
        let hash = match (gnu_hash, sysv_hash) {
            (Some(table), _) => parse_gnu_hash(&elf, table)?,
            (None, Some(table)) => parse_sysv_hash(&elf, table)?,
            (None, None) => return Err(VdsoError::MissingHashTable),
        };

        let mut image = Self {
            elf,
            load_offset: base.wrapping_add(bias as usize),
            symtab,
            strtab,
            hash,
            // symbol versions mean nothing without their definitions
            versym: versym.filter(|_| verdef.is_some()),
            version: None,
        };
        image.version = verdef.and_then(|verdef| image.find_version(verdef, version));
        if image.version.is_none() && image.versym.is_some() {
            debug!("vDSO does not define {}, ignoring symbol versions", version.name);
        }
        Ok(image)
    }

    /// Index of the version definition matching `key`.
    fn find_version(&self, verdef: usize, key: &VersionKey) -> Option<u16> {
        let mut def = verdef;
        loop {
            let flags = self.elf.u16_at(def.checked_add(VD_FLAGS)?)?;
            if flags & VER_FLG_BASE == 0 && self.elf.u32_at(def + VD_HASH)? == key.hash {
                let aux = def.checked_add(self.elf.u32_at(def + VD_AUX)? as usize)?;
                let name = self.elf.u32_at(aux.checked_add(VDA_NAME)?)?;
                if self.string(name)? == key.name.as_bytes() {
                    return Some(self.elf.u16_at(def + VD_NDX)? & VERSYM_INDEX_MASK);
                }
            }
            let next = self.elf.u32_at(def.checked_add(VD_NEXT)?)?;
            if next == 0 {
                return None;
            }
            def = def.checked_add(next as usize)?;
        }
    }

    fn string(&self, offset: u32) -> Option<&'a [u8]> {
        self.elf.cstr_at(self.strtab.checked_add(offset as usize)?)
    }

    /// Runtime address of the exported function `name`, if the image defines it.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        match self.hash {
            HashTable::Sysv {
                nbucket,
                nchain,
                buckets,
                chain,
            } => {
                let bucket = elf_hash(name.as_bytes()) % nbucket;
                let mut index = self.elf.u32_element(buckets, bucket as usize)?;
                // a well-formed chain visits each symbol at most once
                for _ in 0..nchain {
                    if index == 0 {
                        break;
                    }
                    if let Some(address) = self.candidate(index as usize, name) {
                        return Some(address);
                    }
                    index = self.elf.u32_element(chain, index as usize)?;
                }
                None
            }
            HashTable::Gnu {
                nbucket,
                symoffset,
                buckets,
                chain,
            } => {
                let hash = gnu_hash(name.as_bytes());
                let mut index = self.elf.u32_element(buckets, (hash % nbucket) as usize)?;
                if index < symoffset {
                    return None;
                }
                loop {
                    let chain_hash = self.elf.u32_element(chain, (index - symoffset) as usize)?;
                    if chain_hash | 1 == hash | 1 {
                        if let Some(address) = self.candidate(index as usize, name) {
                            return Some(address);
                        }
                    }
                    if chain_hash & 1 != 0 {
                        return None;
                    }
                    index = index.checked_add(1)?;
                }
            }
        }
    }

    /// Address of symbol `index` if it is a defined, exported function named `name`
    /// carrying the required version.
    fn candidate(&self, index: usize, name: &str) -> Option<usize> {
        let sym = self.elf.symbol(self.symtab, index)?;
        if !matches!(sym.kind(), STT_FUNC | STT_NOTYPE)
            || !matches!(sym.bind(), STB_GLOBAL | STB_WEAK)
            || sym.shndx == SHN_UNDEF
        {
            return None;
        }
        if self.string(sym.name)? != name.as_bytes() {
            return None;
        }
        if let (Some(required), Some(versym)) = (self.version, self.versym) {
            let version = self.elf.u16_at(versym.checked_add(index.checked_mul(2)?)?)?;
            if version & VERSYM_INDEX_MASK != required {
                return None;
            }
        }
        Some(self.load_offset.wrapping_add(sym.value as usize))
    }

    pub fn uses_gnu_hash(&self) -> bool {
        matches!(self.hash, HashTable::Gnu { .. })
    }

    /// Version index symbols are checked against, if any.
    pub fn required_version(&self) -> Option<u16> {
        self.version
    }
}

fn parse_gnu_hash(elf: &ElfBytes, table: usize) -> Result<HashTable, VdsoError> {
    let field = |n: usize| elf.u32_element(table, n).ok_or(VdsoError::BadHashTable);
    let nbucket = field(0)?;
    let symoffset = field(1)?;
    let bloom_words = field(2)? as usize;
    if nbucket == 0 {
        return Err(VdsoError::BadHashTable);
    }
    // the bloom filter is skipped, not consulted
    let buckets = bloom_words
        .checked_mul(GNU_BLOOM_WORD_SIZE)
        .and_then(|bloom| bloom.checked_add(GNU_HASH_HEADER_SIZE))
        .and_then(|offset| offset.checked_add(table))
        .ok_or(VdsoError::BadHashTable)?;
    let chain = buckets
        .checked_add(nbucket as usize * 4)
        .filter(|&chain| elf.contains(buckets, chain - buckets))
        .ok_or(VdsoError::BadHashTable)?;
    Ok(HashTable::Gnu {
        nbucket,
        symoffset,
        buckets,
        chain,
    })
}

fn parse_sysv_hash(elf: &ElfBytes, table: usize) -> Result<HashTable, VdsoError> {
    let field = |n: usize| elf.u32_element(table, n).ok_or(VdsoError::BadHashTable);
    let nbucket = field(0)?;
    let nchain = field(1)?;
    if nbucket == 0 {
        return Err(VdsoError::BadHashTable);
    }
    let buckets = table
        .checked_add(SYSV_HASH_HEADER_SIZE)
        .ok_or(VdsoError::BadHashTable)?;
    let chain = buckets
        .checked_add(nbucket as usize * 4)
        .ok_or(VdsoError::BadHashTable)?;
    if !elf.contains(chain, nchain as usize * 4) {
        return Err(VdsoError::BadHashTable);
    }
    Ok(HashTable::Sysv {
        nbucket,
        nchain,
        buckets,
        chain,
    })
}

/// `AT_SYSINFO_EHDR` from a raw auxiliary vector of native-endian word pairs.
pub(crate) fn parse_auxv(auxv: &[u8]) -> Option<usize> {
    const WORD: usize = size_of::<usize>();
    let word = |bytes: &[u8]| bytes.try_into().ok().map(usize::from_ne_bytes);
    for pair in auxv.chunks_exact(2 * WORD) {
        let tag = word(&pair[..WORD])?;
        let value = word(&pair[WORD..])?;
        match tag {
            AT_NULL => break,
            AT_SYSINFO_EHDR if value != 0 => return Some(value),
            _ => {}
        }
    }
    None
}

/// Length of the `[vdso]` mapping starting at `base`, from `/proc/self/maps` text.
pub(crate) fn parse_vdso_mapping_len(maps: &str, base: usize) -> Option<usize> {
    maps.lines()
        .filter(|line| line.trim_end().ends_with("[vdso]"))
        .find_map(|line| {
            let (start, end) = line.split_whitespace().next()?.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            if start != base {
                return None;
            }
            end.checked_sub(start)
        })
}

/// Byte length of the image at `base` as described by its own headers.
///
/// # Safety
///
/// `base` must point to a readable ELF header whose program header table is readable.
unsafe fn image_len_from_headers(base: usize) -> Option<usize> {
    // safety: the caller guarantees the header is readable
    let header_bytes = unsafe { std::slice::from_raw_parts(base as *const u8, EHDR_SIZE) };
    let header = ElfBytes::new(header_bytes).header()?;
    let table_end = header.table_end().filter(|&end| end <= MAX_IMAGE_SIZE)?;
    // safety: the caller guarantees the program header table is readable
    let table = unsafe { std::slice::from_raw_parts(base as *const u8, table_end) };
    let table = ElfBytes::new(table);
    let mut len = table_end;
    for index in 0..header.phnum {
        let phdr = table.program_header(&header, index)?;
        if phdr.p_type == PT_LOAD {
            let end = usize::try_from(phdr.offset.checked_add(phdr.filesz)?).ok()?;
            len = len.max(end);
        }
    }
    (len <= MAX_IMAGE_SIZE).then_some(len)
}

/// The process's vDSO descriptor plus the addresses resolved from it at startup.
#[derive(Debug, Default)]
pub struct Vdso {
    image: Option<VdsoImage<'static>>,
    symbols: HashMap<&'static str, usize>,
}

impl Vdso {
    /// Locates and parses the vDSO of the running process through
    /// `<procfs>/self/auxv`.
    ///
    /// A process without a vDSO, or with an image that cannot be parsed, gets an
    /// empty descriptor whose lookups all return `None`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::Io`] if the auxiliary vector cannot be read.
    pub fn from_auxv(config: &NumaConfig) -> Result<Self, NumaError> {
        if !cfg!(target_os = "linux") {
            return Ok(Self::default());
        }
        let auxv = fs::read(config.self_auxv())?;
        let Some(base) = parse_auxv(&auxv) else {
            debug!("auxiliary vector has no AT_SYSINFO_EHDR entry");
            return Ok(Self::default());
        };

        let mapping_len = fs::read_to_string(config.self_maps())
            .ok()
            .and_then(|maps| parse_vdso_mapping_len(&maps, base));
        let len = match mapping_len {
            Some(len) => Some(len),
            // safety: the kernel maps the vDSO readable at `base` for the whole
            // lifetime of the process and never unmaps or modifies it
            None => unsafe { image_len_from_headers(base) },
        };
        let Some(len) = len else {
            debug!("cannot size the vDSO image at {base:#x}");
            return Ok(Self::default());
        };
        // safety: as above, `len` bytes from `base` are mapped readable and immutable
        let bytes: &'static [u8] = unsafe { std::slice::from_raw_parts(base as *const u8, len) };
        Ok(Self::from_image(VdsoImage::parse(bytes, base)))
    }

    pub(crate) fn from_image(image: Option<VdsoImage<'static>>) -> Self {
        let symbols = image
            .map(|image| {
                KNOWN_SYMBOLS
                    .iter()
                    .filter_map(|&name| Some((name, image.lookup(name)?)))
                    .collect()
            })
            .unwrap_or_default();
        Self { image, symbols }
    }

    /// Whether the image was found and parsed.
    pub fn is_valid(&self) -> bool {
        self.image.is_some()
    }

    /// Runtime address of the vDSO function `name`, or `None` if it is not exported.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.symbols
            .get(name)
            .copied()
            .or_else(|| self.image.as_ref()?.lookup(name))
            .filter(|&address| address != 0)
    }
}
