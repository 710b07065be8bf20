//! Record layouts and the binary codec contract.
//!
//! Every key and value stored in a kernel-shared table is described by a
//! static [`RecordLayout`]: the ordered fields of the matching kernel struct,
//! their widths (padding included) and the byte order each one is stored in.
//! Types implement [`Record`] on top of [`RecordWriter`] / [`RecordReader`],
//! which walk the layout field by field so that the encoded bytes can never
//! drift from the descriptor.

use crate::{byteorder::ByteOrder, Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::fmt;

/// One field of a kernel struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldLayout {
    pub name: &'static str,
    /// Width in bytes.
    pub width: usize,
    pub order: ByteOrder,
    /// Explicit padding; always encoded as zeroes and ignored on decode.
    pub padding: bool,
}

impl FieldLayout {
    pub const fn host(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width,
            order: ByteOrder::Host,
            padding: false,
        }
    }

    pub const fn network(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width,
            order: ByteOrder::Network,
            padding: false,
        }
    }

    pub const fn padding(name: &'static str, width: usize) -> Self {
        Self {
            name,
            width,
            order: ByteOrder::Host,
            padding: true,
        }
    }
}

/// Byte-exact description of a kernel struct.
///
/// A layout never changes once a table has been created with it; a different
/// layout needs a new table identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordLayout {
    pub name: &'static str,
    /// `sizeof` of the kernel struct.
    pub size: usize,
    pub fields: &'static [FieldLayout],
}

impl RecordLayout {
    pub const fn new(name: &'static str, size: usize, fields: &'static [FieldLayout]) -> Self {
        Self { name, size, fields }
    }

    /// Check that the descriptor is self-consistent: every field has a
    /// supported width, names are unique and the widths add up to `size`.
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(self.invalid("layout has no fields".into()));
        }

        let mut total = 0usize;
        for (idx, field) in self.fields.iter().enumerate() {
            if field.width == 0 {
                return Err(self.invalid(format!("field {} has zero width", field.name)));
            }
            if !field.padding && !matches!(field.width, 1 | 2 | 4) {
                return Err(self.invalid(format!(
                    "field {} has unsupported width {}",
                    field.name, field.width
                )));
            }
            if self.fields[..idx].iter().any(|f| f.name == field.name) {
                return Err(self.invalid(format!("duplicate field {}", field.name)));
            }
            total += field.width;
        }

        if total != self.size {
            return Err(self.invalid(format!(
                "fields cover {} bytes but the record is {} bytes",
                total, self.size
            )));
        }

        Ok(())
    }

    /// Like [`RecordLayout::validate`], additionally requiring the Rust
    /// mirror type `T` to have exactly the declared size.
    pub fn validate_for<T>(&self) -> Result<()> {
        self.validate()?;
        let actual = std::mem::size_of::<T>();
        if actual != self.size {
            return Err(self.invalid(format!(
                "type is {} bytes but the record is {} bytes",
                actual, self.size
            )));
        }
        Ok(())
    }

    /// Fail with `MalformedRecord` unless `actual` is exactly the record size.
    pub fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.size {
            return Err(Error::MalformedRecord {
                layout: self.name,
                expected: self.size,
                actual,
            });
        }
        Ok(())
    }

    /// Byte offset of the named field.
    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.fields_with_offsets()
            .find(|(_, f)| f.name == name)
            .map(|(offset, _)| offset)
    }

    pub fn fields_with_offsets(&self) -> impl Iterator<Item = (usize, &FieldLayout)> + '_ {
        self.fields.iter().scan(0usize, |offset, field| {
            let at = *offset;
            *offset += field.width;
            Some((at, field))
        })
    }

    /// Two layouts are compatible when they would produce identical bytes
    /// for the same values: same size, same field widths and byte orders.
    /// Field names may differ.
    pub fn is_compatible_with(&self, other: &RecordLayout) -> bool {
        self.size == other.size
            && self.fields.len() == other.fields.len()
            && self.fields.iter().zip(other.fields).all(|(a, b)| {
                a.width == b.width && a.order == b.order && a.padding == b.padding
            })
    }

    fn invalid(&self, reason: String) -> Error {
        Error::InvalidLayout {
            layout: self.name,
            reason,
        }
    }
}

impl fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes):", self.name, self.size)?;
        for (offset, field) in self.fields_with_offsets() {
            write!(f, " {}@{}[{}", field.name, offset, field.width)?;
            if field.padding {
                write!(f, ",pad")?;
            } else if field.order == ByteOrder::Network {
                write!(f, ",network")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Binary codec contract for a key or value of a kernel-shared table.
///
/// `encode` is deterministic (padding is always zeroed) and produces exactly
/// `layout().size` bytes. `decode` accepts only buffers of exactly that
/// length and reports anything else as [`Error::MalformedRecord`].
/// `Display` is the diagnostic rendering used by logs and tooling.
pub trait Record: Sized + Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Fixed-size buffer handed to the map syscalls for this record.
    type Raw: aya::Pod + Default + AsRef<[u8]> + AsMut<[u8]> + Send + Sync;

    fn layout() -> &'static RecordLayout;

    fn encode(&self) -> Bytes;

    fn decode(raw: &[u8]) -> Result<Self>;

    /// Validate the layout against itself and against the Rust type size.
    fn check_layout() -> Result<()> {
        Self::layout().validate_for::<Self>()
    }
}

/// Copy an encoded record into its fixed-size syscall buffer.
pub fn to_raw<R: Record>(bytes: &[u8]) -> Result<R::Raw> {
    let mut raw = R::Raw::default();
    let dst = raw.as_mut();
    if dst.len() != bytes.len() {
        return Err(Error::MalformedRecord {
            layout: R::layout().name,
            expected: dst.len(),
            actual: bytes.len(),
        });
    }
    dst.copy_from_slice(bytes);
    Ok(raw)
}

/// Serializes a record field by field, following its layout.
pub struct RecordWriter {
    layout: &'static RecordLayout,
    buf: BytesMut,
    next: usize,
}

impl RecordWriter {
    pub fn new(layout: &'static RecordLayout) -> Self {
        Self {
            layout,
            buf: BytesMut::with_capacity(layout.size),
            next: 0,
        }
    }

    fn field(&mut self, width: usize) -> &'static FieldLayout {
        let field = &self.layout.fields[self.next];
        debug_assert_eq!(
            field.width, width,
            "{}.{} written with the wrong width",
            self.layout.name, field.name
        );
        self.next += 1;
        field
    }

    pub fn put_u8(mut self, value: u8) -> Self {
        self.field(1);
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(mut self, value: u16) -> Self {
        let order = self.field(2).order;
        self.buf.put_u16_ne(order.u16_to_wire(value));
        self
    }

    pub fn put_u32(mut self, value: u32) -> Self {
        let order = self.field(4).order;
        self.buf.put_u32_ne(order.u32_to_wire(value));
        self
    }

    /// Zero-fill the next field, whatever its width.
    pub fn pad(mut self) -> Self {
        let width = self.layout.fields[self.next].width;
        self.field(width);
        self.buf.put_bytes(0, width);
        self
    }

    pub fn finish(self) -> Bytes {
        debug_assert_eq!(self.next, self.layout.fields.len());
        debug_assert_eq!(self.buf.len(), self.layout.size);
        self.buf.freeze()
    }
}

/// Deserializes a record field by field, following its layout.
pub struct RecordReader<'a> {
    layout: &'static RecordLayout,
    buf: &'a [u8],
    next: usize,
}

impl<'a> RecordReader<'a> {
    /// Fails with `MalformedRecord` unless `raw` has exactly the record size.
    pub fn new(layout: &'static RecordLayout, raw: &'a [u8]) -> Result<Self> {
        layout.check_len(raw.len())?;
        Ok(Self {
            layout,
            buf: raw,
            next: 0,
        })
    }

    fn field(&mut self, width: usize) -> &'static FieldLayout {
        let field = &self.layout.fields[self.next];
        debug_assert_eq!(
            field.width, width,
            "{}.{} read with the wrong width",
            self.layout.name, field.name
        );
        self.next += 1;
        field
    }

    pub fn get_u8(&mut self) -> u8 {
        self.field(1);
        self.buf.get_u8()
    }

    pub fn get_u16(&mut self) -> u16 {
        let order = self.field(2).order;
        order.u16_from_wire(self.buf.get_u16_ne())
    }

    pub fn get_u32(&mut self) -> u32 {
        let order = self.field(4).order;
        order.u32_from_wire(self.buf.get_u32_ne())
    }

    pub fn skip_pad(&mut self) {
        let width = self.layout.fields[self.next].width;
        self.field(width);
        self.buf.advance(width);
    }
}
