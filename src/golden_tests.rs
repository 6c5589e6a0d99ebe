//! End-to-end scenarios: byte-exact verification against known inputs and
//! reference decompressors.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

use crate::gzip::parse_member;
use crate::worker;

/// Wrap a raw deflate stream in a minimal gzip member. The trailer CRC is
/// left zero: the engine reads but never verifies it.
fn raw_gzip(deflate: &[u8], isize_hint: u32) -> Vec<u8> {
    let mut raw = vec![0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0x03];
    raw.extend_from_slice(deflate);
    raw.extend_from_slice(&[0, 0, 0, 0]);
    raw.extend_from_slice(&isize_hint.to_le_bytes());
    raw
}

fn gzip_of(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn decode(raw: &[u8], threads: usize) -> crate::error::PgzResult<Vec<u8>> {
    let member = parse_member(raw)?;
    let mut out = Vec::new();
    worker::decompress(member.deflate, &mut out, threads, false)?;
    Ok(out)
}

#[test]
fn empty_member() {
    // An empty file compresses to a single final fixed-Huffman block.
    let raw = raw_gzip(&[0x03, 0x00], 0);
    assert_eq!(decode(&raw, 1).unwrap(), b"");
}

#[test]
fn fixed_huffman_member() {
    let raw = raw_gzip(&[0xCB, 0x48, 0xCD, 0xC9, 0xC9, 0xE7, 0x02, 0x00], 6);
    assert_eq!(decode(&raw, 1).unwrap(), b"hello\n");
}

#[test]
fn stored_member() {
    let raw = raw_gzip(&[0x01, 0x03, 0x00, 0xFC, 0xFF, b'a', b'b', b'c'], 3);
    assert_eq!(decode(&raw, 1).unwrap(), b"abc");
}

#[test]
fn highly_compressible_run() {
    // 64 KiB of 'A': far too small for parallel chunks, so the driver
    // degrades to a single worker; output must still be exact.
    let text = vec![b'A'; 65536];
    let raw = gzip_of(&text);
    assert_eq!(decode(&raw, 4).unwrap(), text);
}

#[test]
fn parallel_text_matches_references() {
    let mut text = Vec::new();
    let mut state = 0xDEADBEEFu64;
    let mut record = 0u64;
    while text.len() < 16 << 20 {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        text.extend_from_slice(
            format!("{:08} field={:016x} tag={:04}\n", record, state, state % 9973).as_bytes(),
        );
        record += 1;
    }
    let raw = gzip_of(&text);

    let ours = decode(&raw, 8).unwrap();

    // flate2 reference.
    let mut reference = Vec::new();
    let mut dec = flate2::read::GzDecoder::new(&raw[..]);
    std::io::Read::read_to_end(&mut dec, &mut reference).unwrap();
    crate::assert_slices_eq!(ours, reference);

    // libdeflate reference.
    let mut libdeflate_out = vec![0u8; text.len() + 64];
    let n = libdeflater::Decompressor::new()
        .gzip_decompress(&raw, &mut libdeflate_out)
        .unwrap();
    crate::assert_slices_eq!(ours, libdeflate_out[..n]);

    // Every emitted byte is text.
    assert!(ours.iter().all(|&b| (b'\t'..=b'~').contains(&b)));
}

#[test]
fn truncated_member_errors() {
    let mut text = Vec::new();
    for i in 0..200_000 {
        text.extend_from_slice(format!("entry {:07} {:x}\n", i, i * 2654435761u64).as_bytes());
    }
    let mut raw = gzip_of(&text);
    raw.truncate(raw.len() - 1024);
    assert!(decode(&raw, 2).is_err());
}
