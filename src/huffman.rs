//! Canonical Huffman decode tables for deflate
//!
//! Tables follow the flat primary + sub-table layout: a `1 << TABLEBITS`
//! primary array indexed directly by the next input bits, with overflow
//! sub-tables appended for codewords longer than TABLEBITS. Every entry is
//! one packed u32:
//!
//! - bits 0..7   codeword length (for a sub-table pointer: index bits)
//! - bit  31     sub-table pointer flag
//! - bit  30     literal flag
//! - bits 8..29  payload: literal value, (length base << 8 | extra bits),
//!               (offset base | extra bits << 16), or sub-table start
//!
//! Three table shapes are used: precode (19 symbols, 7 table bits, max
//! codeword 7), literal/length (288 symbols, 10 table bits, max codeword
//! 15) and offset (32 symbols, 8 table bits, max codeword 15).

use std::sync::OnceLock;

pub const PRECODE_TABLEBITS: u32 = 7;
pub const LITLEN_TABLEBITS: u32 = 10;
pub const OFFSET_TABLEBITS: u32 = 8;

/// Worst-case table sizes (primary plus all sub-tables).
pub const PRECODE_ENOUGH: usize = 128;
pub const LITLEN_ENOUGH: usize = 1334;
pub const OFFSET_ENOUGH: usize = 402;

pub const NUM_PRECODE_SYMS: usize = 19;
pub const NUM_LITLEN_SYMS: usize = 288;
pub const NUM_OFFSET_SYMS: usize = 32;

pub const MAX_PRE_CODEWORD_LEN: u32 = 7;
pub const MAX_CODEWORD_LEN: u32 = 15;

/// A run of up to 138 zero lengths may overshoot the requested count by up
/// to 137 entries; the lens buffer is oversized so the expansion loop never
/// needs a bounds check.
pub const MAX_LENS_OVERRUN: usize = 137;

/// Order in which precode codeword lengths appear in the stream.
pub const PRECODE_LENS_PERMUTATION: [u8; NUM_PRECODE_SYMS] =
    [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

pub const HUFFDEC_SUBTABLE_POINTER: u32 = 1 << 31;
pub const HUFFDEC_LITERAL: u32 = 1 << 30;
pub const HUFFDEC_LENGTH_MASK: u32 = 0xFF;
pub const HUFFDEC_RESULT_SHIFT: u32 = 8;
pub const HUFFDEC_LENGTH_BASE_SHIFT: u32 = 8;
pub const HUFFDEC_EXTRA_LENGTH_BITS_MASK: u32 = 0xFF;
pub const HUFFDEC_OFFSET_BASE_MASK: u32 = 0xFFFF;
pub const HUFFDEC_EXTRA_OFFSET_BITS_SHIFT: u32 = 16;

/// Length base 0 is reserved for end-of-block.
pub const HUFFDEC_END_OF_BLOCK_LENGTH: u32 = 0;

/// RFC 1951 length code bases and extra-bit counts, symbols 257..285.
const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

/// RFC 1951 offset code bases and extra-bit counts, symbols 0..29.
const OFFSET_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const OFFSET_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12,
    13, 13,
];

const fn precode_results() -> [u32; NUM_PRECODE_SYMS] {
    let mut res = [0u32; NUM_PRECODE_SYMS];
    let mut i = 0;
    while i < NUM_PRECODE_SYMS {
        res[i] = (i as u32) << HUFFDEC_RESULT_SHIFT;
        i += 1;
    }
    res
}

const fn litlen_results() -> [u32; NUM_LITLEN_SYMS] {
    let mut res = [0u32; NUM_LITLEN_SYMS];
    let mut i = 0;
    while i < 256 {
        res[i] = HUFFDEC_LITERAL | ((i as u32) << HUFFDEC_RESULT_SHIFT);
        i += 1;
    }
    // End-of-block: a length symbol whose base is zero.
    res[256] = HUFFDEC_END_OF_BLOCK_LENGTH << HUFFDEC_RESULT_SHIFT;
    i = 257;
    while i < NUM_LITLEN_SYMS {
        // Symbols 286/287 never occur in a valid stream; give them the
        // same shape as symbol 285 so the table builder stays branchless.
        let slot = if i - 257 < 29 { i - 257 } else { 28 };
        let payload = ((LENGTH_BASE[slot] as u32) << HUFFDEC_LENGTH_BASE_SHIFT)
            | LENGTH_EXTRA[slot] as u32;
        res[i] = payload << HUFFDEC_RESULT_SHIFT;
        i += 1;
    }
    res
}

const fn offset_results() -> [u32; NUM_OFFSET_SYMS] {
    let mut res = [0u32; NUM_OFFSET_SYMS];
    let mut i = 0;
    while i < NUM_OFFSET_SYMS {
        let slot = if i < 30 { i } else { 29 };
        let payload = (OFFSET_BASE[slot] as u32)
            | ((OFFSET_EXTRA[slot] as u32) << HUFFDEC_EXTRA_OFFSET_BITS_SHIFT);
        res[i] = payload << HUFFDEC_RESULT_SHIFT;
        i += 1;
    }
    res
}

pub static PRECODE_DECODE_RESULTS: [u32; NUM_PRECODE_SYMS] = precode_results();
pub static LITLEN_DECODE_RESULTS: [u32; NUM_LITLEN_SYMS] = litlen_results();
pub static OFFSET_DECODE_RESULTS: [u32; NUM_OFFSET_SYMS] = offset_results();

#[inline]
fn make_entry(results: &[u32], sym: usize, len: u32) -> u32 {
    results[sym] | len
}

/// Build one decode table from per-symbol codeword lengths.
///
/// Returns false for an over-subscribed code, or for an incomplete code
/// other than the two permitted degenerate shapes (no symbols at all, or a
/// single symbol with codeword length 1).
///
/// Codewords are processed in (length, symbol) order with a bit-reversed
/// codeword counter, so primary entries land at the stride positions the
/// peek-index lookup expects. Codewords longer than `table_bits` go to
/// sub-tables; a sub-table's width grows until the remaining codewords can
/// fill it completely.
pub fn build_decode_table(
    table: &mut [u32],
    lens: &[u8],
    num_syms: usize,
    results: &[u32],
    table_bits: u32,
    max_codeword_len: u32,
    sorted_syms: &mut [u16],
) -> bool {
    let mut len_counts = [0u32; MAX_CODEWORD_LEN as usize + 1];
    for &len in &lens[..num_syms] {
        len_counts[len as usize] += 1;
    }

    // Counting sort: offsets[len] = number of codewords shorter than len.
    let mut offsets = [0u32; MAX_CODEWORD_LEN as usize + 2];
    offsets[0] = 0;
    offsets[1] = len_counts[0];
    let mut codespace_used: u32 = 0;
    for len in 1..=max_codeword_len as usize {
        offsets[len + 1] = offsets[len] + len_counts[len];
        codespace_used = (codespace_used << 1) + len_counts[len];
    }
    for (sym, &len) in lens[..num_syms].iter().enumerate() {
        sorted_syms[offsets[len as usize] as usize] = sym as u16;
        offsets[len as usize] += 1;
    }
    // Skip the unused (length 0) symbols.
    let mut sorted_pos = len_counts[0] as usize;

    if codespace_used > 1u32 << max_codeword_len {
        return false;
    }
    if codespace_used < 1u32 << max_codeword_len {
        let sym = if codespace_used == 0 {
            0
        } else {
            if codespace_used != 1u32 << (max_codeword_len - 1) || len_counts[1] != 1 {
                return false;
            }
            sorted_syms[sorted_pos] as usize
        };
        let entry = make_entry(results, sym, 1);
        for slot in table[..1 << table_bits].iter_mut() {
            *slot = entry;
        }
        return true;
    }

    let mut codeword: usize = 0;
    let mut len: u32 = 1;
    while len_counts[len as usize] == 0 {
        len += 1;
    }
    let mut count = len_counts[len as usize];
    let mut cur_table_end = 1usize << len;

    while len <= table_bits {
        loop {
            table[codeword] = make_entry(results, sorted_syms[sorted_pos] as usize, len);
            sorted_pos += 1;

            if codeword == cur_table_end - 1 {
                // Last codeword (all ones): replicate what we have up to
                // the full primary size.
                while len < table_bits {
                    table.copy_within(0..cur_table_end, cur_table_end);
                    cur_table_end <<= 1;
                    len += 1;
                }
                return true;
            }
            // Increment the bit-reversed codeword: set the last zero bit
            // and clear the ones above it.
            let bit = 1usize << (usize::BITS - 1 - (codeword ^ (cur_table_end - 1)).leading_zeros());
            codeword &= bit - 1;
            codeword |= bit;

            count -= 1;
            if count == 0 {
                break;
            }
        }

        loop {
            len += 1;
            if len <= table_bits {
                table.copy_within(0..cur_table_end, cur_table_end);
                cur_table_end <<= 1;
            }
            count = len_counts[len as usize];
            if count != 0 {
                break;
            }
        }
    }

    // Remaining codewords are longer than table_bits: fill sub-tables.
    cur_table_end = 1usize << table_bits;
    let mut subtable_prefix = usize::MAX;
    let mut subtable_start = 0usize;
    loop {
        if codeword & ((1usize << table_bits) - 1) != subtable_prefix {
            subtable_prefix = codeword & ((1usize << table_bits) - 1);
            subtable_start = cur_table_end;
            let mut subtable_bits = len - table_bits;
            codespace_used = count;
            while codespace_used < 1u32 << subtable_bits {
                subtable_bits += 1;
                codespace_used =
                    (codespace_used << 1) + len_counts[(table_bits + subtable_bits) as usize];
            }
            cur_table_end = subtable_start + (1usize << subtable_bits);
            table[subtable_prefix] = HUFFDEC_SUBTABLE_POINTER
                | ((subtable_start as u32) << HUFFDEC_RESULT_SHIFT)
                | subtable_bits;
        }

        let entry = make_entry(results, sorted_syms[sorted_pos] as usize, len - table_bits);
        sorted_pos += 1;
        let mut i = subtable_start + (codeword >> table_bits);
        let stride = 1usize << (len - table_bits);
        while i < cur_table_end {
            table[i] = entry;
            i += stride;
        }

        if codeword == (1usize << len) - 1 {
            return true;
        }
        let bit = 1usize << (usize::BITS - 1 - (codeword ^ ((1usize << len) - 1)).leading_zeros());
        codeword &= bit - 1;
        codeword |= bit;
        count -= 1;
        while count == 0 {
            len += 1;
            count = len_counts[len as usize];
        }
    }
}

/// Per-worker decode state: the scratch length buffers and the three
/// tables. Each worker owns one, so table builds never cross threads.
pub struct Decoder {
    pub precode_lens: [u8; NUM_PRECODE_SYMS],
    /// Litlen then offset lengths, oversized for the RLE overrun.
    pub lens: [u8; NUM_LITLEN_SYMS + NUM_OFFSET_SYMS + MAX_LENS_OVERRUN],
    sorted_syms: [u16; NUM_LITLEN_SYMS],
    pub precode_table: [u32; PRECODE_ENOUGH],
    pub litlen_table: [u32; LITLEN_ENOUGH],
    pub offset_table: [u32; OFFSET_ENOUGH],
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder {
            precode_lens: [0; NUM_PRECODE_SYMS],
            lens: [0; NUM_LITLEN_SYMS + NUM_OFFSET_SYMS + MAX_LENS_OVERRUN],
            sorted_syms: [0; NUM_LITLEN_SYMS],
            precode_table: [0; PRECODE_ENOUGH],
            litlen_table: [0; LITLEN_ENOUGH],
            offset_table: [0; OFFSET_ENOUGH],
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_precode_table(&mut self) -> bool {
        build_decode_table(
            &mut self.precode_table,
            &self.precode_lens,
            NUM_PRECODE_SYMS,
            &PRECODE_DECODE_RESULTS,
            PRECODE_TABLEBITS,
            MAX_PRE_CODEWORD_LEN,
            &mut self.sorted_syms,
        )
    }

    pub fn build_litlen_table(&mut self, num_litlen_syms: usize) -> bool {
        build_decode_table(
            &mut self.litlen_table,
            &self.lens,
            num_litlen_syms,
            &LITLEN_DECODE_RESULTS,
            LITLEN_TABLEBITS,
            MAX_CODEWORD_LEN,
            &mut self.sorted_syms,
        )
    }

    pub fn build_offset_table(&mut self, num_litlen_syms: usize, num_offset_syms: usize) -> bool {
        build_decode_table(
            &mut self.offset_table,
            &self.lens[num_litlen_syms..],
            num_offset_syms,
            &OFFSET_DECODE_RESULTS,
            OFFSET_TABLEBITS,
            MAX_CODEWORD_LEN,
            &mut self.sorted_syms,
        )
    }
}

/// Decode tables for fixed-Huffman blocks, built once per process.
pub struct StaticTables {
    pub litlen_table: [u32; LITLEN_ENOUGH],
    pub offset_table: [u32; OFFSET_ENOUGH],
}

static STATIC_TABLES: OnceLock<Box<StaticTables>> = OnceLock::new();

pub fn static_tables() -> &'static StaticTables {
    STATIC_TABLES.get_or_init(|| {
        let mut d = Box::new(Decoder::new());
        for i in 0..144 {
            d.lens[i] = 8;
        }
        for i in 144..256 {
            d.lens[i] = 9;
        }
        for i in 256..280 {
            d.lens[i] = 7;
        }
        for i in 280..NUM_LITLEN_SYMS {
            d.lens[i] = 8;
        }
        for i in NUM_LITLEN_SYMS..NUM_LITLEN_SYMS + NUM_OFFSET_SYMS {
            d.lens[i] = 5;
        }
        let litlen_ok = d.build_litlen_table(NUM_LITLEN_SYMS);
        let offset_ok = d.build_offset_table(NUM_LITLEN_SYMS, NUM_OFFSET_SYMS);
        assert!(litlen_ok && offset_ok);
        Box::new(StaticTables {
            litlen_table: d.litlen_table,
            offset_table: d.offset_table,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk a table the way the decode loop does.
    fn decode_one(table: &[u32], table_bits: u32, mut bits: u32) -> (u32, u32) {
        let mut entry = table[(bits & ((1 << table_bits) - 1)) as usize];
        let mut consumed = 0;
        if entry & HUFFDEC_SUBTABLE_POINTER != 0 {
            bits >>= table_bits;
            consumed += table_bits;
            let start = (entry >> HUFFDEC_RESULT_SHIFT) & 0xFFFF;
            let idx_bits = entry & HUFFDEC_LENGTH_MASK;
            entry = table[(start + (bits & ((1 << idx_bits) - 1))) as usize];
        }
        consumed += entry & HUFFDEC_LENGTH_MASK;
        (entry >> HUFFDEC_RESULT_SHIFT, consumed)
    }

    #[test]
    fn simple_canonical_code() {
        // lens: sym0=2, sym1=1, sym2=3, sym3=3
        // canonical codes: sym1=0, sym0=10, sym2=110, sym3=111
        let lens = [2u8, 1, 3, 3];
        let results: Vec<u32> = (0..4).map(|s| (s as u32) << HUFFDEC_RESULT_SHIFT).collect();
        let mut table = vec![0u32; 1 << 7];
        let mut sorted = [0u16; 4];
        assert!(build_decode_table(&mut table, &lens, 4, &results, 7, 7, &mut sorted));

        // Input bits are codewords reversed: sym1 -> ...0, sym0 -> ...01,
        // sym2 -> ...011, sym3 -> ...111
        assert_eq!(decode_one(&table, 7, 0b0000_0000), (1, 1));
        assert_eq!(decode_one(&table, 7, 0b0000_0001), (0, 2));
        assert_eq!(decode_one(&table, 7, 0b0000_0011), (2, 3));
        assert_eq!(decode_one(&table, 7, 0b0000_0111), (3, 3));
    }

    #[test]
    fn rejects_over_subscribed() {
        let lens = [1u8, 1, 1];
        let results = [0u32; 3];
        let mut table = vec![0u32; 1 << 7];
        let mut sorted = [0u16; 3];
        assert!(!build_decode_table(&mut table, &lens, 3, &results, 7, 7, &mut sorted));
    }

    #[test]
    fn accepts_degenerate_single_symbol() {
        let lens = [0u8, 1, 0];
        let results: Vec<u32> = (0..3).map(|s| (s as u32) << HUFFDEC_RESULT_SHIFT).collect();
        let mut table = vec![0u32; 1 << 7];
        let mut sorted = [0u16; 3];
        assert!(build_decode_table(&mut table, &lens, 3, &results, 7, 7, &mut sorted));
        // Every slot decodes the lone symbol at length 1.
        for i in 0..(1 << 7) {
            assert_eq!(decode_one(&table, 7, i), (1, 1));
        }
    }

    #[test]
    fn rejects_other_incomplete_codes() {
        let lens = [2u8, 2, 2]; // 3 of 4 slots used
        let results = [0u32; 3];
        let mut table = vec![0u32; 1 << 7];
        let mut sorted = [0u16; 3];
        assert!(!build_decode_table(&mut table, &lens, 3, &results, 7, 7, &mut sorted));
    }

    #[test]
    fn subtable_routing() {
        // With 2 table bits, the two 3-bit codewords need a sub-table.
        let lens = [1u8, 2, 3, 3];
        let results: Vec<u32> = (0..4).map(|s| (s as u32) << HUFFDEC_RESULT_SHIFT).collect();
        let mut table = vec![0u32; 64];
        let mut sorted = [0u16; 4];
        assert!(build_decode_table(&mut table, &lens, 4, &results, 2, 7, &mut sorted));

        // codes: sym0=0, sym1=10, sym2=110, sym3=111
        assert_eq!(decode_one(&table, 2, 0b000), (0, 1));
        assert_eq!(decode_one(&table, 2, 0b001), (1, 2));
        assert_eq!(decode_one(&table, 2, 0b011), (2, 3));
        assert_eq!(decode_one(&table, 2, 0b111), (3, 3));
        assert!(table[0b11] & HUFFDEC_SUBTABLE_POINTER != 0);
    }

    #[test]
    fn static_litlen_table_decodes_known_codes() {
        let t = static_tables();
        // Literal 'A' (65) has the 8-bit code 0b00110000 + 65 = 0b01110001,
        // transmitted LSB-first, so the peek value is its bit reversal.
        let code: u32 = 0b0111_0001;
        let reversed = code.reverse_bits() >> (32 - 8);
        let (result, consumed) = decode_one(&t.litlen_table, LITLEN_TABLEBITS, reversed);
        assert_eq!(consumed, 8);
        assert_eq!(result & 0xFF, 65);
        // End-of-block is the 7-bit all-zero code.
        let (result, consumed) = decode_one(&t.litlen_table, LITLEN_TABLEBITS, 0);
        assert_eq!(consumed, 7);
        assert_eq!(result >> HUFFDEC_LENGTH_BASE_SHIFT, HUFFDEC_END_OF_BLOCK_LENGTH);
    }

    #[test]
    fn offset_table_payload_shape() {
        let t = static_tables();
        // Offset symbol 0 (code 00000) -> base 1, no extra bits.
        let (payload, consumed) = decode_one(&t.offset_table, OFFSET_TABLEBITS, 0);
        assert_eq!(consumed, 5);
        assert_eq!(payload & HUFFDEC_OFFSET_BASE_MASK, 1);
        assert_eq!(payload >> HUFFDEC_EXTRA_OFFSET_BITS_SHIFT, 0);
    }
}
