//! Box builders for tests.
//!
//! Available to local tests and to downstream crate tests when the
//! `test-utils` feature is enabled.

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.push(((flags >> 16) & 0xFF) as u8);
    body.push(((flags >> 8) & 0xFF) as u8);
    body.push((flags & 0xFF) as u8);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

/// A media reference of `size` bytes lasting `duration` timescale units.
pub fn sidx_entry(size: u32, duration: u32, starts_with_sap: bool) -> [u8; 12] {
    let mut entry = [0u8; 12];
    entry[0..4].copy_from_slice(&(size & 0x7FFF_FFFF).to_be_bytes());
    entry[4..8].copy_from_slice(&duration.to_be_bytes());
    let sap = if starts_with_sap { 0x9000_0000u32 } else { 0 };
    entry[8..12].copy_from_slice(&sap.to_be_bytes());
    entry
}

/// A complete `sidx` box with reference ID 1 and an earliest presentation
/// time of zero.
pub fn make_sidx(version: u8, timescale: u32, first_offset: u64, entries: &[[u8; 12]]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1u32.to_be_bytes());
    payload.extend_from_slice(&timescale.to_be_bytes());
    if version == 0 {
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&(first_offset as u32).to_be_bytes());
    } else {
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(&first_offset.to_be_bytes());
    }
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&(entries.len() as u16).to_be_bytes());
    for entry in entries {
        payload.extend_from_slice(entry);
    }
    make_full_box(b"sidx", version, 0, &payload)
}
