//! Symbol hash functions of the two ELF hash-table formats.

/// The SysV `DT_HASH` hash.
pub const fn elf_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    let mut i = 0;
    while i < name.len() {
        h = (h << 4).wrapping_add(name[i] as u32);
        let high = h & 0xf000_0000;
        if high != 0 {
            h ^= high >> 24;
        }
        h &= !high;
        i += 1;
    }
    h
}

/// The `DT_GNU_HASH` hash (Bernstein's `h * 33 + c`).
pub const fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    let mut i = 0;
    while i < name.len() {
        h = h.wrapping_mul(33).wrapping_add(name[i] as u32);
        i += 1;
    }
    h
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case("__vdso_getcpu", 0xb01045, 0x6562b026)]
    #[test_case("__vdso_gettimeofday", 0x315ca59, 0xb01bca00)]
    #[test_case("__vdso_clock_gettime", 0xd35ec75, 0x6e43a318)]
    #[test_case("__vdso_time", 0xa33c485, 0x821e8e0d)]
    #[test_case("LINUX_2.6", 0x3ae75f6, 0x26c62a8a)]
    #[test_case("", 0, 5381)]
    fn test_hashes(name: &str, expected_elf: u32, expected_gnu: u32) {
        assert_eq!(elf_hash(name.as_bytes()), expected_elf, "{name}");
        assert_eq!(gnu_hash(name.as_bytes()), expected_gnu, "{name}");
    }

    #[test]
    fn test_elf_hash_keeps_top_nibble_clear() {
        let long = b"a_rather_long_symbol_name_that_overflows_the_top_nibble";
        assert_eq!(elf_hash(long) & 0xf000_0000, 0);
    }

    #[test]
    fn test_hashes_are_const() {
        const GETCPU: u32 = elf_hash(b"__vdso_getcpu");
        const GETCPU_GNU: u32 = gnu_hash(b"__vdso_getcpu");
        assert_eq!(GETCPU, 0xb01045);
        assert_eq!(GETCPU_GNU, 0x6562b026);
    }
}
