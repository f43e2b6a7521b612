//! Path hash used by SqPack index tables
//!
//! The archive keys every entry by a 32-bit CRC of its lowercase path. The
//! hash is the reflected CRC-32 (polynomial `0xEDB88320`) processed four
//! bytes per table cycle, seeded with `0xFFFFFFFF` and returned without the
//! usual final XOR. Any deviation from these tables makes lookups miss.

/// Reflected CRC-32 polynomial.
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

/// Initial running value.
pub const SEED: u32 = 0xFFFF_FFFF;

/// Slicing-by-4 lookup tables, generated at compile time.
pub static CRC_TABLES: [[u32; 256]; 4] = make_tables();

const fn make_tables() -> [[u32; 256]; 4] {
    let mut tables = [[0u32; 256]; 4];

    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        tables[0][i] = crc;
        i += 1;
    }

    let mut i = 0;
    while i < 256 {
        let mut t = 1;
        while t < 4 {
            let prev = tables[t - 1][i];
            tables[t][i] = (prev >> 8) ^ tables[0][(prev & 0xFF) as usize];
            t += 1;
        }
        i += 1;
    }

    tables
}

/// Continue a running hash over `data`.
pub fn crc_update(mut crc: u32, data: &[u8]) -> u32 {
    let mut words = data.chunks_exact(4);
    for word in &mut words {
        crc ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        crc = CRC_TABLES[3][(crc & 0xFF) as usize]
            ^ CRC_TABLES[2][((crc >> 8) & 0xFF) as usize]
            ^ CRC_TABLES[1][((crc >> 16) & 0xFF) as usize]
            ^ CRC_TABLES[0][(crc >> 24) as usize];
    }

    for &byte in words.remainder() {
        crc = CRC_TABLES[0][((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }

    crc
}

/// Hash raw bytes exactly as stored in the index tables.
///
/// ```
/// use sqpack_crypto::crc_hash;
///
/// assert_eq!(crc_hash(b"123456789"), 0x340B_C6D9);
/// ```
pub fn crc_hash(data: &[u8]) -> u32 {
    crc_update(SEED, data)
}

/// Normalize a single path byte: ASCII lowercase, backslash to slash.
#[inline]
pub const fn normalize_byte(byte: u8) -> u8 {
    if byte == b'\\' {
        b'/'
    } else {
        byte.to_ascii_lowercase()
    }
}

/// Normalize a path string the way the index tables expect it.
pub fn normalize_path(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\\' => '/',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Hash a path string after normalization.
///
/// Case and separator style do not affect the result.
pub fn path_hash(text: &str) -> u32 {
    let normalized: Vec<u8> = text.bytes().map(normalize_byte).collect();
    crc_hash(&normalized)
}
