//! Placeholder compaction for mid-stream chunks
//!
//! A speculative chunk starts with 32768 distinct placeholder symbols, one
//! per byte of the unknown upstream context. After a few blocks, matches
//! have usually overwritten most of them: the live placeholders in the
//! current 32 KiB context shrink to a handful. Once at most 129 remain,
//! they fit the byte values above '~', and decoding can continue in a
//! plain 8-bit window.

use crate::window::{CONTEXT_SIZE, FIRST_BACKREF_SYMBOL};

/// Byte codes available for compacted placeholders: `'~'+1 ..= 255`.
pub const NUM_COMPACT_CODES: usize = 256 - FIRST_BACKREF_SYMBOL as usize;

const CODE_LIMIT: usize = FIRST_BACKREF_SYMBOL as usize + NUM_COMPACT_CODES;

pub struct BackrefMultiplexer {
    /// Compact code -> offset into the upstream context.
    lkt: [u16; 256],
    allocated: usize,
}

impl Default for BackrefMultiplexer {
    fn default() -> Self {
        BackrefMultiplexer {
            lkt: [0; 256],
            allocated: FIRST_BACKREF_SYMBOL as usize,
        }
    }
}

impl BackrefMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite a 16-bit context into compact byte codes. Fails when more
    /// than 129 distinct placeholders are live; the caller may retry after
    /// further blocks have narrowed the context.
    pub fn compress(&mut self, wide_ctx: &[u16], out_ctx: &mut [u8]) -> bool {
        debug_assert_eq!(wide_ctx.len(), CONTEXT_SIZE);
        debug_assert_eq!(out_ctx.len(), CONTEXT_SIZE);

        let mut next_code = FIRST_BACKREF_SYMBOL as usize;
        for (slot, &sym) in out_ctx.iter_mut().zip(wide_ctx) {
            *slot = if sym < FIRST_BACKREF_SYMBOL {
                sym as u8
            } else {
                let offset = sym - FIRST_BACKREF_SYMBOL;
                // Linear scan of the codes allocated so far; the set is
                // small by the time compaction can succeed.
                match (FIRST_BACKREF_SYMBOL as usize..next_code)
                    .find(|&code| self.lkt[code] == offset)
                {
                    Some(code) => code as u8,
                    None => {
                        if next_code == CODE_LIMIT {
                            return false;
                        }
                        self.lkt[next_code] = offset;
                        next_code += 1;
                        (next_code - 1) as u8
                    }
                }
            };
        }
        self.allocated = next_code;
        true
    }

    /// Combine the compaction map with the true upstream context into a
    /// single byte-to-byte table: resolved ASCII maps to itself, compact
    /// codes map to the context byte they stand for.
    pub fn resolve_table(&self, upstream_ctx: &[u8]) -> [u8; 256] {
        debug_assert_eq!(upstream_ctx.len(), CONTEXT_SIZE);
        let mut table = [0u8; 256];
        for (code, slot) in table.iter_mut().enumerate() {
            *slot = if code < FIRST_BACKREF_SYMBOL as usize {
                code as u8
            } else if code < self.allocated {
                upstream_ctx[self.lkt[code] as usize]
            } else {
                // Unallocated codes never appear in the window.
                0
            };
        }
        table
    }
}

/// Resolve one 16-bit symbol against the true upstream context.
#[inline]
pub fn resolve_wide(sym: u16, upstream_ctx: &[u8]) -> u8 {
    if sym < FIRST_BACKREF_SYMBOL {
        sym as u8
    } else {
        upstream_ctx[(sym - FIRST_BACKREF_SYMBOL) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const _: () = assert!(NUM_COMPACT_CODES == 129);
    const _: () = assert!(crate::window::MAX_ASCII == 126);

    fn wide_context(placeholders: &[(usize, u16)]) -> Vec<u16> {
        let mut ctx = vec![b'.' as u16; CONTEXT_SIZE];
        for &(pos, offset) in placeholders {
            ctx[pos] = FIRST_BACKREF_SYMBOL + offset;
        }
        ctx
    }

    #[test]
    fn compacts_and_resolves() {
        let ctx = wide_context(&[(0, 100), (5, 7), (6, 100), (100, 31000)]);
        let mut mux = BackrefMultiplexer::new();
        let mut compact = vec![0u8; CONTEXT_SIZE];
        assert!(mux.compress(&ctx, &mut compact));

        // Identical placeholders share a code.
        assert_eq!(compact[0], compact[6]);
        assert_ne!(compact[0], compact[5]);
        assert_eq!(compact[1], b'.');

        let mut upstream = vec![b'u'; CONTEXT_SIZE];
        upstream[100] = b'A';
        upstream[7] = b'B';
        upstream[31000] = b'C';
        let table = mux.resolve_table(&upstream);
        assert_eq!(table[compact[0] as usize], b'A');
        assert_eq!(table[compact[5] as usize], b'B');
        assert_eq!(table[compact[100] as usize], b'C');
        assert_eq!(table[b'.' as usize], b'.');
    }

    #[test]
    fn fails_past_129_live_placeholders() {
        let pairs: Vec<(usize, u16)> = (0..130).map(|i| (i, i as u16 * 3)).collect();
        let ctx = wide_context(&pairs);
        let mut mux = BackrefMultiplexer::new();
        let mut compact = vec![0u8; CONTEXT_SIZE];
        assert!(!mux.compress(&ctx, &mut compact));

        // Exactly 129 fits.
        let pairs: Vec<(usize, u16)> = (0..129).map(|i| (i, i as u16 * 3)).collect();
        let ctx = wide_context(&pairs);
        assert!(mux.compress(&ctx, &mut compact));
        // All 129 codes are distinct byte values above '~'.
        let codes: std::collections::BTreeSet<u8> = compact[..129].iter().copied().collect();
        assert_eq!(codes.len(), 129);
        assert!(codes.iter().all(|&c| c > b'~'));
    }

    #[test]
    fn resolve_wide_symbols() {
        let mut upstream = vec![b'z'; CONTEXT_SIZE];
        upstream[0] = b'a';
        upstream[CONTEXT_SIZE - 1] = b'q';
        assert_eq!(resolve_wide(b'k' as u16, &upstream), b'k');
        assert_eq!(resolve_wide(FIRST_BACKREF_SYMBOL, &upstream), b'a');
        assert_eq!(
            resolve_wide(FIRST_BACKREF_SYMBOL + CONTEXT_SIZE as u16 - 1, &upstream),
            b'q'
        );
    }
}
