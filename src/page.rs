use crate::errors::{DatabaseError, Result};

/// A fixed-size physical page holding one column's values for one stripe.
/// Values are fixed-width big-endian signed integers, appended until the
/// payload is full. The bytes-used counter doubles as the next write offset.
///
/// On disk a page is serialized as a `record_size`-byte bytes-used header
/// followed by the payload.
#[derive(Clone, Debug)]
pub struct Page {
    data: Vec<u8>,
    bytes: usize,
    record_size: usize,

    /// Set on any write; cleared when the page reaches disk.
    pub(crate) dirty: bool,

    /// Pinned pages are exempt from eviction.
    pub(crate) pin_count: u32,
}

impl Page {
    pub fn new(page_size: usize, record_size: usize) -> Page {
        Page {
            data: vec![0; page_size],
            bytes: 0,
            record_size,
            dirty: false,
            pin_count: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.bytes + self.record_size <= self.data.len()
    }

    /// Append one value, returning the byte offset it was written at.
    pub fn write(&mut self, value: i128) -> Result<usize> {
        if !self.has_capacity() {
            return Err(DatabaseError::PageFull);
        }

        let offset = self.bytes;
        self.encode(value, offset);
        self.bytes += self.record_size;
        self.dirty = true;
        Ok(offset)
    }

    /// Decode the value at a byte offset.
    pub fn read(&self, offset: usize) -> i128 {
        debug_assert!(offset + self.record_size <= self.data.len());
        decode(&self.data[offset..offset + self.record_size])
    }

    /// Overwrite the value at a byte offset in place.
    pub fn update(&mut self, value: i128, offset: usize) {
        debug_assert!(offset + self.record_size <= self.bytes);
        self.encode(value, offset);
        self.dirty = true;
    }

    /// All written values, in write order.
    pub fn iter(&self) -> impl Iterator<Item = i128> + '_ {
        (0..self.num_records()).map(move |i| self.read(i * self.record_size))
    }

    pub fn num_records(&self) -> usize {
        self.bytes / self.record_size
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes
    }

    /// Serialized image: bytes-used header followed by the payload.
    pub fn to_file_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.record_size + self.data.len());
        out.extend_from_slice(&encode_cell(self.bytes as i128, self.record_size));
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_file_bytes(buf: &[u8], page_size: usize, record_size: usize) -> Result<Page> {
        if buf.len() < record_size + page_size {
            return Err(DatabaseError::Metadata(format!(
                "page file truncated: {} bytes, expected {}",
                buf.len(),
                record_size + page_size
            )));
        }

        let bytes = decode(&buf[..record_size]) as usize;
        if bytes > page_size || bytes % record_size != 0 {
            return Err(DatabaseError::Metadata(format!(
                "page header reports invalid bytes-used {}",
                bytes
            )));
        }

        Ok(Page {
            data: buf[record_size..record_size + page_size].to_vec(),
            bytes,
            record_size,
            dirty: false,
            pin_count: 0,
        })
    }

    fn encode(&mut self, value: i128, offset: usize) {
        let cell = encode_cell(value, self.record_size);
        self.data[offset..offset + self.record_size].copy_from_slice(&cell);
    }
}

fn encode_cell(value: i128, record_size: usize) -> Vec<u8> {
    let be = value.to_be_bytes();
    be[be.len() - record_size..].to_vec()
}

fn decode(cell: &[u8]) -> i128 {
    let fill = if cell[0] & 0x80 != 0 { 0xFF } else { 0 };
    let mut buf = [fill; 16];
    buf[16 - cell.len()..].copy_from_slice(cell);
    i128::from_be_bytes(buf)
}
