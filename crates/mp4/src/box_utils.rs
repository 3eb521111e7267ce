use crate::cursor::BoxCursor;
use crate::error::BoxParseError;

/// Header of a single ISOBMFF box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Total box size including the header.
    pub size: u64,
    pub fourcc: [u8; 4],
    /// 8 for a compact header, 16 when a 64-bit size follows the type.
    pub header_size: u64,
}

impl BoxHeader {
    pub fn body_size(&self) -> u64 {
        self.size - self.header_size
    }

    pub fn is(&self, fourcc: &[u8; 4]) -> bool {
        &self.fourcc == fourcc
    }
}

/// Read a box header at the start of `data`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`),
/// and box-extends-to-EOF (`size == 0`).
pub fn read_box_header(data: &[u8]) -> Result<BoxHeader, BoxParseError> {
    let mut cursor = BoxCursor::new(data);
    read_header(&mut cursor, data.len() as u64)
}

pub(crate) fn read_header(
    cursor: &mut BoxCursor<'_>,
    available: u64,
) -> Result<BoxHeader, BoxParseError> {
    let start = cursor.position() as u64;
    let size = cursor.read_u32()? as u64;
    let fourcc = cursor.read_fourcc()?;

    let (size, header_size) = match size {
        1 => (cursor.read_u64()?, 16),
        0 => (available.saturating_sub(start), 8),
        size => (size, 8),
    };

    if size < header_size {
        return Err(BoxParseError::new(
            start,
            format!("box size {size} is smaller than its {header_size}-byte header"),
        ));
    }

    Ok(BoxHeader {
        size,
        fourcc,
        header_size,
    })
}

/// Find the first top-level box with the given FourCC. Returns the box's
/// offset within `data` and its header.
///
/// Boxes that extend past the end of `data` stop the walk; the target may
/// still be returned if its own header starts inside the buffer.
pub fn find_box(data: &[u8], target: &[u8; 4]) -> Result<Option<(u64, BoxHeader)>, BoxParseError> {
    let mut offset = 0u64;
    let len = data.len() as u64;

    while offset + 8 <= len {
        let header = read_box_header(&data[offset as usize..])
            .map_err(|e| BoxParseError::new(offset + e.offset, e.reason))?;
        if header.is(target) {
            return Ok(Some((offset, header)));
        }
        offset = match offset.checked_add(header.size) {
            Some(next) => next,
            None => break,
        };
    }

    Ok(None)
}
