//! Segment index box (`sidx`, ISO/IEC 14496-12 8.16.3).

use media_types::ByteRange;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::box_utils::{find_box, read_header};
use crate::cursor::BoxCursor;
use crate::error::BoxParseError;

const SIDX: &[u8; 4] = b"sidx";

/// One entry of a segment index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidxReference {
    /// `true` when the reference points at another `sidx` rather than media.
    pub reference_type: bool,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
    pub sap_type: u8,
    pub sap_delta_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidx {
    pub version: u8,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub first_offset: u64,
    pub references: Vec<SidxReference>,
    /// Size of the whole box, header included.
    pub box_size: u64,
    /// Offset of the first reference entry from the start of the box.
    pub references_at: u64,
}

/// Bytes per reference entry.
const REFERENCE_LEN: u64 = 12;

impl Sidx {
    /// Byte ranges of the referenced subsegments, in order. `anchor` is the
    /// absolute offset of the first byte after this box; the first range
    /// starts `first_offset` bytes past it and each range follows the last.
    ///
    /// Only media references are supported: an entry pointing at a nested
    /// `sidx` is an error, as is an offset past `u64::MAX`. Error offsets are
    /// relative to the start of this box.
    pub fn segment_ranges(&self, anchor: u64) -> Result<Vec<ByteRange>, BoxParseError> {
        let mut offset = anchor.checked_add(self.first_offset).ok_or_else(|| {
            BoxParseError::new(self.references_at, "first_offset overflows the file position")
        })?;

        let mut ranges = Vec::with_capacity(self.references.len());
        for (i, reference) in self.references.iter().enumerate() {
            let at = self.references_at + REFERENCE_LEN * i as u64;
            if reference.reference_type {
                return Err(BoxParseError::new(
                    at,
                    "reference to a nested sidx box is not supported",
                ));
            }
            let length = reference.referenced_size as u64;
            let next = offset.checked_add(length).ok_or_else(|| {
                BoxParseError::new(at, "referenced_size overflows the file position")
            })?;
            ranges.push(ByteRange::new(offset, length));
            offset = next;
        }
        Ok(ranges)
    }

    /// Subsegment durations in seconds.
    pub fn durations(&self) -> impl Iterator<Item = f64> + '_ {
        let timescale = self.timescale.max(1) as f64;
        self.references
            .iter()
            .map(move |r| r.subsegment_duration as f64 / timescale)
    }
}

/// Parse one `sidx` box that starts at the first byte of `data`.
pub fn parse_sidx(data: &[u8]) -> Result<Sidx, BoxParseError> {
    let mut cursor = BoxCursor::new(data);
    let header = read_header(&mut cursor, data.len() as u64)?;
    if !header.is(SIDX) {
        return Err(BoxParseError::new(
            4,
            format!(
                "expected box type `sidx`, found `{}`",
                String::from_utf8_lossy(&header.fourcc)
            ),
        ));
    }

    let version_at = cursor.position() as u64;
    let version = cursor.read_u8()?;
    let _flags = cursor.read_u24()?;
    let reference_id = cursor.read_u32()?;
    let timescale = cursor.read_u32()?;

    let (earliest_presentation_time, first_offset) = match version {
        0 => (cursor.read_u32()? as u64, cursor.read_u32()? as u64),
        1 => (cursor.read_u64()?, cursor.read_u64()?),
        other => {
            return Err(BoxParseError::new(
                version_at,
                format!("unsupported sidx version {other}"),
            ));
        }
    };

    cursor.skip(2)?;
    let reference_count = cursor.read_u16()?;
    let references_at = cursor.position() as u64;

    let mut references = Vec::with_capacity(reference_count as usize);
    for _ in 0..reference_count {
        let word = cursor.read_u32()?;
        let subsegment_duration = cursor.read_u32()?;
        let sap = cursor.read_u32()?;
        references.push(SidxReference {
            reference_type: word >> 31 == 1,
            referenced_size: word & 0x7FFF_FFFF,
            subsegment_duration,
            starts_with_sap: sap >> 31 == 1,
            sap_type: ((sap >> 28) & 0x7) as u8,
            sap_delta_time: sap & 0x0FFF_FFFF,
        });
    }

    if (cursor.position() as u64) > header.size {
        return Err(BoxParseError::new(
            header.size,
            format!(
                "{reference_count} references overrun the declared box size of {} bytes",
                header.size
            ),
        ));
    }

    debug!(
        version,
        timescale,
        references = references.len(),
        "parsed sidx box"
    );

    Ok(Sidx {
        version,
        reference_id,
        timescale,
        earliest_presentation_time,
        first_offset,
        references,
        box_size: header.size,
        references_at,
    })
}

/// Locate and parse the first top-level `sidx` box in `data`, returning its
/// offset within `data` alongside the parsed box.
pub fn find_sidx(data: &[u8]) -> Result<Option<(u64, Sidx)>, BoxParseError> {
    let Some((offset, _)) = find_box(data, SIDX)? else {
        return Ok(None);
    };
    let sidx = parse_sidx(&data[offset as usize..])
        .map_err(|e| BoxParseError::new(offset + e.offset, e.reason))?;
    Ok(Some((offset, sidx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_box, make_sidx, sidx_entry};

    #[test]
    fn parses_version_zero() {
        let data = make_sidx(
            0,
            90_000,
            0,
            &[sidx_entry(1000, 180_000, true), sidx_entry(1500, 180_000, true)],
        );
        let sidx = parse_sidx(&data).unwrap();

        assert_eq!(sidx.version, 0);
        assert_eq!(sidx.reference_id, 1);
        assert_eq!(sidx.timescale, 90_000);
        assert_eq!(sidx.references.len(), 2);
        assert_eq!(sidx.box_size, data.len() as u64);

        let first = sidx.references[0];
        assert!(!first.reference_type);
        assert_eq!(first.referenced_size, 1000);
        assert!(first.starts_with_sap);
        assert_eq!(first.sap_type, 1);

        assert_eq!(sidx.durations().collect::<Vec<_>>(), vec![2.0, 2.0]);
    }

    #[test]
    fn parses_version_one_with_wide_fields() {
        let data = make_sidx(1, 1000, 0x1_0000_0000, &[sidx_entry(10, 500, false)]);
        let sidx = parse_sidx(&data).unwrap();
        assert_eq!(sidx.version, 1);
        assert_eq!(sidx.first_offset, 0x1_0000_0000);
        assert!(!sidx.references[0].starts_with_sap);
    }

    #[test]
    fn bit_fields_are_split() {
        let mut entry = [0u8; 12];
        entry[0..4].copy_from_slice(&(0x8000_0000u32 | 0x1234).to_be_bytes());
        entry[4..8].copy_from_slice(&7u32.to_be_bytes());
        entry[8..12].copy_from_slice(&(0x8000_0000u32 | (3 << 28) | 0x0ABC_DEF0).to_be_bytes());
        let sidx = parse_sidx(&make_sidx(0, 1, 0, &[entry])).unwrap();

        let reference = sidx.references[0];
        assert!(reference.reference_type);
        assert_eq!(reference.referenced_size, 0x1234);
        assert_eq!(reference.subsegment_duration, 7);
        assert!(reference.starts_with_sap);
        assert_eq!(reference.sap_type, 3);
        assert_eq!(reference.sap_delta_time, 0x0ABC_DEF0);
    }

    #[test]
    fn ranges_start_after_box_plus_first_offset() {
        let data = make_sidx(0, 1, 16, &[sidx_entry(100, 1, true), sidx_entry(50, 1, true)]);
        let sidx = parse_sidx(&data).unwrap();
        let anchor = 800 + sidx.box_size;
        assert_eq!(
            sidx.segment_ranges(anchor).unwrap(),
            vec![
                ByteRange::new(anchor + 16, 100),
                ByteRange::new(anchor + 116, 50)
            ]
        );
    }

    #[test]
    fn nested_sidx_references_are_rejected() {
        let mut nested = sidx_entry(64, 1, true);
        nested[0] |= 0x80;
        let data = make_sidx(0, 1, 0, &[sidx_entry(100, 1, true), nested]);
        let sidx = parse_sidx(&data).unwrap();
        assert!(sidx.references[1].reference_type);

        let err = sidx.segment_ranges(1000).unwrap_err();
        // Second entry: references start at byte 32, 12 bytes per entry.
        assert_eq!(err.offset, 32 + 12);
        assert!(err.reason.contains("nested sidx"));
    }

    #[test]
    fn overflowing_offsets_are_errors() {
        let data = make_sidx(1, 1, u64::MAX - 10, &[sidx_entry(100, 1, true)]);
        let sidx = parse_sidx(&data).unwrap();
        assert!(sidx.segment_ranges(100).is_err());

        let data = make_sidx(1, 1, 0, &[sidx_entry(100, 1, true)]);
        let sidx = parse_sidx(&data).unwrap();
        assert!(sidx.segment_ranges(u64::MAX - 50).is_err());
    }

    #[test]
    fn truncated_entries_report_offset() {
        let data = make_sidx(0, 1, 0, &[sidx_entry(100, 1, true)]);
        let truncated = &data[..data.len() - 6];
        let err = parse_sidx(truncated).unwrap_err();
        // Header 8 + fullbox 4 + ids 8 + times 8 + reserved/count 4 + 4 bytes into the entry.
        assert_eq!(err.offset, 36);
    }

    #[test]
    fn wrong_box_type_is_rejected() {
        let data = make_box(b"moof", &[0u8; 24]);
        let err = parse_sidx(&data).unwrap_err();
        assert!(err.reason.contains("moof"));
    }

    #[test]
    fn find_sidx_skips_leading_boxes() {
        let mut data = make_box(b"styp", b"msdh");
        let sidx_at = data.len() as u64;
        data.extend(make_sidx(0, 1, 0, &[sidx_entry(42, 1, true)]));

        let (offset, sidx) = find_sidx(&data).unwrap().unwrap();
        assert_eq!(offset, sidx_at);
        assert_eq!(sidx.references[0].referenced_size, 42);
        assert!(find_sidx(&make_box(b"free", &[])).unwrap().is_none());
    }
}
