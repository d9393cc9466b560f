//! BER-TLV support.
//!
//! [`parse`] reads one TLV unit and describes it by offsets into the source buffer; nothing is
//! copied. [`Reader`] walks sibling units inside a range, and [`schema`] maps a whole record
//! onto a declarative tree of named fields.

pub mod schema;

use std::borrow::Cow;
use std::ops::Range;

/// Errors raised on malformed BER-TLV input. Every variant carries the offending offset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Truncated tag at offset {0}")]
    TruncatedTag(usize),

    #[error("Tag at offset {0} is longer than 4 bytes")]
    TagTooLong(usize),

    #[error("Truncated length at offset {0}")]
    TruncatedLength(usize),

    #[error("Indefinite length at offset {0} is not supported")]
    IndefiniteLength(usize),

    #[error("Length at offset {offset} uses {count} length bytes (maximum is 4)")]
    LengthOfLengthTooLarge { offset: usize, count: usize },

    #[error("Value at offset {offset} declares {length} bytes but only {available} remain")]
    TruncatedValue {
        offset: usize,
        length: usize,
        available: usize,
    },
}

impl Error {
    /// The offset in the source buffer where parsing failed.
    pub const fn offset(&self) -> usize {
        match self {
            Self::TruncatedTag(o)
            | Self::TagTooLong(o)
            | Self::TruncatedLength(o)
            | Self::IndefiniteLength(o) => *o,
            Self::LengthOfLengthTooLarge { offset, .. } | Self::TruncatedValue { offset, .. } => {
                *offset
            }
        }
    }
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Class bits of a tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Class {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl From<u8> for Class {
    fn from(first: u8) -> Self {
        match first >> 6 {
            0 => Self::Universal,
            1 => Self::Application,
            2 => Self::ContextSpecific,
            _ => Self::Private,
        }
    }
}

/// A decoded tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    raw: u32,
    class: Class,
    constructed: bool,
    number: u32,
}

impl Tag {
    /// The tag octets as they appear on the wire, e.g. `0x5F20`.
    pub const fn raw(&self) -> u32 {
        self.raw
    }

    pub const fn class(&self) -> Class {
        self.class
    }

    pub const fn is_constructed(&self) -> bool {
        self.constructed
    }

    /// The tag number, with multi-byte numbers reassembled from their 7-bit groups.
    pub const fn number(&self) -> u32 {
        self.number
    }
}

/// One parsed TLV unit. Ranges are offsets into the buffer it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: Tag,
    offset: usize,
    value: Range<usize>,
}

impl Tlv {
    pub const fn tag(&self) -> Tag {
        self.tag
    }

    /// Offset of the first tag octet.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Number of octets taken by the tag and length fields.
    pub const fn header_len(&self) -> usize {
        self.value.start - self.offset
    }

    /// The declared length of the value.
    pub const fn length(&self) -> usize {
        self.value.end - self.value.start
    }

    /// Range of the value octets.
    pub fn value_range(&self) -> Range<usize> {
        self.value.clone()
    }

    /// Range of the whole unit, header included.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.value.end
    }

    /// Offset immediately after the unit, where the next sibling starts.
    pub const fn end_offset(&self) -> usize {
        self.value.end
    }

    /// Borrows the value octets out of the buffer the unit was parsed from.
    pub fn value<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[self.value.clone()]
    }
}

/// Parses the TLV unit starting at `offset`.
pub fn parse(buffer: &[u8], offset: usize) -> Result<Tlv> {
    parse_within(buffer, offset, buffer.len())
}

/// Calculates the entire encoded size of a TLV unit from a buffer holding at least its tag and
/// length octets.
pub fn encoded_len(header: &[u8]) -> Result<usize> {
    let (_, value_start, length) = parse_header(header, 0, header.len())?;

    Ok(value_start + length)
}

pub(crate) fn parse_within(buffer: &[u8], offset: usize, end: usize) -> Result<Tlv> {
    let (tag, value_start, length) = parse_header(buffer, offset, end)?;

    let available = end.saturating_sub(value_start);
    if length > available {
        return Err(Error::TruncatedValue {
            offset: value_start,
            length,
            available,
        });
    }

    Ok(Tlv {
        tag,
        offset,
        value: value_start..value_start + length,
    })
}

/// Reads the tag and length fields, returning the tag, the value offset and the declared length.
fn parse_header(buffer: &[u8], offset: usize, end: usize) -> Result<(Tag, usize, usize)> {
    let end = end.min(buffer.len());
    let byte_at = |i: usize| if i < end { Some(buffer[i]) } else { None };

    let first = byte_at(offset).ok_or(Error::TruncatedTag(offset))?;
    let mut raw = first as u32;
    let mut number = (first & 0x1F) as u32;
    let mut cursor = offset + 1;

    if first & 0x1F == 0x1F {
        number = 0;
        loop {
            if cursor - offset >= 4 {
                return Err(Error::TagTooLong(offset));
            }

            let b = byte_at(cursor).ok_or(Error::TruncatedTag(offset))?;
            raw = (raw << 8) | b as u32;
            number = (number << 7) | (b & 0x7F) as u32;
            cursor += 1;

            if b & 0x80 == 0 {
                break;
            }
        }
    }

    let tag = Tag {
        raw,
        class: Class::from(first),
        constructed: first & 0x20 != 0,
        number,
    };

    let at = cursor;
    let head = byte_at(at).ok_or(Error::TruncatedLength(at))?;
    cursor += 1;

    let length = match head {
        h if h & 0x80 == 0 => h as usize,
        0x80 => return Err(Error::IndefiniteLength(at)),
        h => {
            let count = (h & 0x7F) as usize;
            if count > 4 {
                return Err(Error::LengthOfLengthTooLarge { offset: at, count });
            }

            let mut size = 0usize;
            for _ in 0..count {
                size <<= 8;
                size |= byte_at(cursor).ok_or(Error::TruncatedLength(at))? as usize;
                cursor += 1;
            }

            size
        }
    };

    Ok((tag, cursor, length))
}

/// Stateful cursor over sibling TLV units inside a range of a buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buffer: &'a [u8],
    cursor: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    /// Creates a new reader over the whole buffer.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::within(buffer, 0..buffer.len())
    }

    /// Creates a new reader over a range of the buffer. Offsets stay relative to the buffer.
    pub fn within(buffer: &'a [u8], range: Range<usize>) -> Self {
        Self {
            buffer,
            cursor: range.start,
            end: range.end.min(buffer.len()),
        }
    }

    /// The offset of the next unit.
    pub const fn offset(&self) -> usize {
        self.cursor
    }

    /// Determines whether all units in the range were consumed.
    pub const fn is_empty(&self) -> bool {
        self.cursor >= self.end
    }

    pub const fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    /// Parses the next unit without seeking the cursor.
    pub fn peek_tlv(&self) -> Result<Tlv> {
        parse_within(self.buffer, self.cursor, self.end)
    }

    /// Parses the next unit and seeks the cursor past it.
    pub fn next_tlv(&mut self) -> Result<Tlv> {
        let tlv = self.peek_tlv()?;
        self.cursor = tlv.end_offset();

        Ok(tlv)
    }

    /// Reads the value of the next unit, seeking the cursor.
    pub fn read_value(&mut self) -> Result<&'a [u8]> {
        let tlv = self.next_tlv()?;

        Ok(tlv.value(self.buffer))
    }

    /// Reads the value of the next unit as text, replacing invalid UTF-8.
    pub fn read_str(&mut self) -> Result<Cow<'a, str>> {
        self.read_value().map(String::from_utf8_lossy)
    }

    /// Reads the value of the next unit as an owned `String`.
    pub fn read_string(&mut self) -> Result<String> {
        self.read_str().map(Cow::into_owned)
    }

    /// Runs the closure over the children of the next unit, seeking the cursor past it.
    pub fn in_constructed<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Reader<'a>) -> Result<T>,
    {
        let tlv = self.next_tlv()?;

        f(&mut Self::within(self.buffer, tlv.value_range()))
    }
}

impl<'a> Iterator for Reader<'a> {
    type Item = Result<Tlv>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_empty() {
            return None;
        }

        let result = self.next_tlv();
        if result.is_err() {
            // Stop after the first malformed unit instead of re-reporting it forever.
            self.cursor = self.end;
        }

        Some(result)
    }
}
