//! Declarative schemas for BER-TLV records.
//!
//! A [`Schema`] is an immutable tree describing the shape of one record type: primitive leaves
//! carry a decoder turning the value octets into a typed value, constructed nodes list their
//! children in on-card order. Children are matched by position, not by tag.
//!
//! ```
//! use cardlink::tlv::schema::Schema;
//!
//! let schema = Schema::constructed(
//!     "attributes",
//!     vec![
//!         Schema::primitive("name", |v: &[u8]| Ok(String::from_utf8(v.to_vec())?)),
//!         Schema::primitive("address", |v: &[u8]| Ok(String::from_utf8(v.to_vec())?)),
//!     ],
//! );
//!
//! let buf = [0xFF, 0x20, 0x07, 0xDF, 0x22, 0x01, 0x41, 0xDF, 0x23, 0x00];
//! let parsed = schema.parse(&buf).unwrap();
//! let record = parsed.as_record().unwrap();
//!
//! assert_eq!(Some(&"A".to_string()), record.value("name"));
//! assert_eq!(vec![3, 7], record.offsets());
//! ```

use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture, FutureExt};

use crate::tlv::{self, Reader, Tlv};

/// Error type returned by field decoders.
pub type DecodeError = Box<dyn std::error::Error + Send + Sync>;

type SyncDecoder<T> = dyn Fn(&[u8]) -> std::result::Result<T, DecodeError> + Send + Sync;
type AsyncDecoder<T> =
    dyn Fn(Vec<u8>) -> BoxFuture<'static, std::result::Result<T, DecodeError>> + Send + Sync;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed TLV in field `{field}`: {source}")]
    Tlv {
        field: String,
        #[source]
        source: tlv::Error,
    },

    #[error("Field `{field}` is missing at offset {offset}")]
    MissingField { field: String, offset: usize },

    #[error("Decoder of field `{field}` failed: {source}")]
    Decode {
        field: String,
        #[source]
        source: DecodeError,
    },

    #[error("Field `{0}` has an asynchronous decoder and cannot be parsed synchronously")]
    AsyncDecoder(String),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Selects how decoders run during a parse.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecodeMode {
    /// Decoders run inline; a schema with asynchronous decoders is rejected.
    #[default]
    Sync,

    /// Every decoder is awaited concurrently; results are reassembled in schema order.
    Async,
}

/// Turns the value octets of a primitive field into a typed value.
pub enum Decoder<T> {
    Sync(Arc<SyncDecoder<T>>),
    Async(Arc<AsyncDecoder<T>>),
}

impl<T> Clone for Decoder<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

impl<T> Debug for Decoder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Decoder::Sync"),
            Self::Async(_) => f.write_str("Decoder::Async"),
        }
    }
}

/// The shape of a record.
#[derive(Debug)]
pub enum Schema<T> {
    Primitive {
        name: Cow<'static, str>,
        decoder: Decoder<T>,
    },
    Constructed {
        name: Cow<'static, str>,
        children: Vec<Schema<T>>,
    },
}

impl<T> Clone for Schema<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Primitive { name, decoder } => Self::Primitive {
                name: name.clone(),
                decoder: decoder.clone(),
            },
            Self::Constructed { name, children } => Self::Constructed {
                name: name.clone(),
                children: children.clone(),
            },
        }
    }
}

impl<T> Schema<T>
where
    T: Send + 'static,
{
    /// A primitive field decoded synchronously.
    pub fn primitive<F>(name: impl Into<Cow<'static, str>>, decoder: F) -> Self
    where
        F: Fn(&[u8]) -> std::result::Result<T, DecodeError> + Send + Sync + 'static,
    {
        Self::Primitive {
            name: name.into(),
            decoder: Decoder::Sync(Arc::new(decoder)),
        }
    }

    /// A primitive field whose decoder has to be awaited, e.g. a signature verification.
    pub fn primitive_async<F, Fut>(name: impl Into<Cow<'static, str>>, decoder: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, DecodeError>> + Send + 'static,
    {
        Self::Primitive {
            name: name.into(),
            decoder: Decoder::Async(Arc::new(move |bytes| decoder(bytes).boxed())),
        }
    }

    /// A constructed field whose children follow each other inside its value.
    pub fn constructed(name: impl Into<Cow<'static, str>>, children: Vec<Schema<T>>) -> Self {
        Self::Constructed {
            name: name.into(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Primitive { name, .. } | Self::Constructed { name, .. } => name,
        }
    }

    /// Parses the record at the start of the buffer, running every decoder inline.
    /// Bytes after the record are ignored.
    pub fn parse(&self, buffer: &[u8]) -> Result<Node<T>> {
        walk(
            self,
            &mut Reader::new(buffer),
            &mut |name: &Cow<'static, str>, decoder: &Decoder<T>, bytes: &[u8]| match decoder {
                Decoder::Sync(f) => f(bytes).map_err(|source| Error::Decode {
                    field: name.to_string(),
                    source,
                }),
                Decoder::Async(_) => Err(Error::AsyncDecoder(name.to_string())),
            },
        )
    }

    /// Parses the record at the start of the buffer, awaiting every decoder.
    ///
    /// The TLV structure is checked in full before any decoder is awaited, so a malformed record
    /// fails without running asynchronous work.
    pub async fn parse_async(&self, buffer: &[u8]) -> Result<Node<T>> {
        let mut leaf = |name: &Cow<'static, str>, decoder: &Decoder<T>, bytes: &[u8]| {
            let field = name.to_string();

            Ok(match decoder {
                Decoder::Sync(f) => {
                    let result = f(bytes).map_err(|source| Error::Decode { field, source });
                    futures::future::ready(result).boxed()
                }
                Decoder::Async(f) => f(bytes.to_vec())
                    .map(|result| result.map_err(|source| Error::Decode { field, source }))
                    .boxed(),
            })
        };

        let pending: Node<Pending<T>> = walk(self, &mut Reader::new(buffer), &mut leaf)?;

        resolve(pending).await
    }

    /// Parses the record in the selected mode.
    pub async fn parse_with(&self, buffer: &[u8], mode: DecodeMode) -> Result<Node<T>> {
        match mode {
            DecodeMode::Sync => self.parse(buffer),
            DecodeMode::Async => self.parse_async(buffer).await,
        }
    }
}

type Pending<T> = BoxFuture<'static, Result<T>>;

fn walk<T, V, L>(schema: &Schema<T>, reader: &mut Reader<'_>, leaf: &mut L) -> Result<Node<V>>
where
    L: FnMut(&Cow<'static, str>, &Decoder<T>, &[u8]) -> Result<V>,
{
    let field = || match schema {
        Schema::Primitive { name, .. } | Schema::Constructed { name, .. } => name.to_string(),
    };

    if reader.is_empty() {
        return Err(Error::MissingField {
            field: field(),
            offset: reader.offset(),
        });
    }

    let tlv = reader.next_tlv().map_err(|source| Error::Tlv {
        field: field(),
        source,
    })?;

    match schema {
        Schema::Primitive { name, decoder } => Ok(Node::Field(Field {
            value: leaf(name, decoder, tlv.value(reader.buffer()))?,
            name: name.clone(),
            tlv,
        })),
        Schema::Constructed { name, children } => {
            let mut inner = Reader::within(reader.buffer(), tlv.value_range());
            let mut fields = Vec::with_capacity(children.len());
            let mut offsets = Vec::with_capacity(children.len());

            for child in children {
                let node = walk(child, &mut inner, leaf)?;
                offsets.push(node.offset());
                fields.push(node);
            }

            Ok(Node::Record(Record {
                name: name.clone(),
                tlv,
                fields,
                offsets,
            }))
        }
    }
}

fn resolve<T>(node: Node<Pending<T>>) -> BoxFuture<'static, Result<Node<T>>>
where
    T: Send + 'static,
{
    async move {
        match node {
            Node::Field(Field { name, tlv, value }) => Ok(Node::Field(Field {
                name,
                tlv,
                value: value.await?,
            })),
            Node::Record(Record {
                name,
                tlv,
                fields,
                offsets,
            }) => Ok(Node::Record(Record {
                name,
                tlv,
                fields: try_join_all(fields.into_iter().map(resolve)).await?,
                offsets,
            })),
        }
    }
    .boxed()
}

/// A parsed field or record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<T> {
    Field(Field<T>),
    Record(Record<T>),
}

impl<T> Node<T> {
    pub fn name(&self) -> &str {
        match self {
            Self::Field(f) => &f.name,
            Self::Record(r) => &r.name,
        }
    }

    /// The TLV unit backing this node.
    pub fn tlv(&self) -> &Tlv {
        match self {
            Self::Field(f) => &f.tlv,
            Self::Record(r) => &r.tlv,
        }
    }

    /// Offset of the first octet of this node in the parsed buffer.
    pub fn offset(&self) -> usize {
        self.tlv().offset()
    }

    /// The decoded value, if this node is a primitive field.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Field(f) => Some(&f.value),
            Self::Record(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record<T>> {
        match self {
            Self::Record(r) => Some(r),
            Self::Field(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Field(f) => Some(f.value),
            Self::Record(_) => None,
        }
    }
}

/// A primitive field and its decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field<T> {
    name: Cow<'static, str>,
    tlv: Tlv,
    value: T,
}

impl<T> Field<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tlv(&self) -> &Tlv {
        &self.tlv
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

/// A constructed field and its children, in schema order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<T> {
    name: Cow<'static, str>,
    tlv: Tlv,
    fields: Vec<Node<T>>,
    offsets: Vec<usize>,
}

impl<T> Record<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tlv(&self) -> &Tlv {
        &self.tlv
    }

    pub fn fields(&self) -> &[Node<T>] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<Node<T>> {
        self.fields
    }

    /// Starting offset of each child, in schema order.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Finds a direct child by name.
    pub fn get(&self, name: &str) -> Option<&Node<T>> {
        self.fields.iter().find(|n| n.name() == name)
    }

    /// The decoded value of a direct primitive child.
    pub fn value(&self, name: &str) -> Option<&T> {
        self.get(name).and_then(Node::value)
    }

    /// A direct constructed child.
    pub fn record(&self, name: &str) -> Option<&Record<T>> {
        self.get(name).and_then(Node::as_record)
    }

    /// The source byte range spanning the children from `first` through `last`, headers
    /// included. This is the range a signature over those fields covers.
    pub fn covered_range(&self, first: &str, last: &str) -> Option<Range<usize>> {
        let start = self.fields.iter().position(|n| n.name() == first)?;
        let end = self.fields.iter().position(|n| n.name() == last)?;

        if start > end {
            return None;
        }

        Some(self.offsets[start]..self.fields[end].tlv().end_offset())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Value {
        Text(String),
        Bytes(Vec<u8>),
        Digest(u32),
    }

    fn text(bytes: &[u8]) -> std::result::Result<Value, DecodeError> {
        Ok(Value::Text(String::from_utf8(bytes.to_vec())?))
    }

    fn bytes(bytes: &[u8]) -> std::result::Result<Value, DecodeError> {
        Ok(Value::Bytes(bytes.to_vec()))
    }

    /// SEQUENCE { [0] "A", [1] "BC", [2] "D" }
    const RECORD: [u8; 13] = [
        0x30, 0x0A, 0x80, 0x01, 0x41, 0x81, 0x02, 0x42, 0x43, 0x82, 0x01, 0x44, 0x00,
    ];

    #[test]
    fn test_field_order_follows_schema() {
        let schema = Schema::constructed(
            "record",
            vec![
                Schema::primitive("c", text),
                Schema::primitive("a", text),
                Schema::primitive("b", text),
            ],
        );

        let node = schema.parse(&RECORD).unwrap();
        let record = node.as_record().unwrap();

        let names: Vec<_> = record.fields().iter().map(Node::name).collect();
        assert_eq!(vec!["c", "a", "b"], names);
        assert_eq!(Some(&Value::Text("A".into())), record.value("c"));
        assert_eq!(Some(&Value::Text("BC".into())), record.value("a"));
        assert_eq!(Some(&Value::Text("D".into())), record.value("b"));
        assert_eq!(vec![2, 5, 9], record.offsets());
    }

    #[test]
    fn test_nested_and_covered_range() {
        // SEQUENCE { SEQUENCE { [0] 01, [1] 02 03 }, [2] FF }
        let buf = [
            0x30, 0x0C, 0x30, 0x07, 0x80, 0x01, 0x01, 0x81, 0x02, 0x02, 0x03, 0x82, 0x01, 0xFF,
        ];
        let schema = Schema::constructed(
            "certificate",
            vec![
                Schema::constructed(
                    "tbs",
                    vec![
                        Schema::primitive("serial", bytes),
                        Schema::primitive("subject", bytes),
                    ],
                ),
                Schema::primitive("signature", bytes),
            ],
        );

        let node = schema.parse(&buf).unwrap();
        let record = node.as_record().unwrap();
        let tbs = record.record("tbs").unwrap();

        assert_eq!(vec![4, 7], tbs.offsets());
        assert_eq!(Some(&Value::Bytes(vec![0x02, 0x03])), tbs.value("subject"));
        assert_eq!(Some(2..11), record.covered_range("tbs", "tbs"));
        assert_eq!(Some(4..11), tbs.covered_range("serial", "subject"));
        assert_eq!(None, tbs.covered_range("subject", "serial"));
    }

    #[test]
    fn test_missing_field() {
        let schema = Schema::constructed(
            "record",
            vec![
                Schema::primitive("a", text),
                Schema::primitive("b", text),
                Schema::primitive("c", text),
                Schema::primitive("d", text),
            ],
        );

        match schema.parse(&RECORD) {
            Err(Error::MissingField { field, offset }) => {
                assert_eq!("d", field);
                assert_eq!(12, offset);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_nested_tlv() {
        // The second child declares 5 bytes inside a 5-byte parent.
        let buf = [0x30, 0x05, 0x80, 0x01, 0x41, 0x81, 0x05, 0x42];
        let schema = Schema::constructed(
            "record",
            vec![Schema::primitive("a", text), Schema::primitive("b", text)],
        );

        match schema.parse(&buf) {
            Err(Error::Tlv { field, source }) => {
                assert_eq!("b", field);
                assert_eq!(7, source.offset());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decoder_failure() {
        let schema = Schema::constructed(
            "record",
            vec![Schema::primitive("a", |_: &[u8]| -> std::result::Result<Value, DecodeError> {
                Err("not a name".into())
            })],
        );

        assert!(matches!(
            schema.parse(&RECORD),
            Err(Error::Decode { field, .. }) if field == "a"
        ));
    }

    #[test]
    fn test_sync_parse_rejects_async_decoder() {
        let schema = Schema::constructed(
            "record",
            vec![Schema::primitive_async("a", |v: Vec<u8>| async move {
                Ok::<_, DecodeError>(Value::Bytes(v))
            })],
        );

        assert!(matches!(
            schema.parse(&RECORD),
            Err(Error::AsyncDecoder(field)) if field == "a"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_results_keep_schema_order() {
        // The first decoder finishes last.
        let delayed = |delay: u64| {
            move |v: Vec<u8>| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok::<_, DecodeError>(Value::Digest(v.iter().map(|b| *b as u32).sum()))
            }
        };

        let schema = Schema::constructed(
            "record",
            vec![
                Schema::primitive_async("a", delayed(30)),
                Schema::primitive("b", text),
                Schema::primitive_async("c", delayed(10)),
            ],
        );

        let node = schema.parse_with(&RECORD, DecodeMode::Async).await.unwrap();
        let values: Vec<_> = node
            .as_record()
            .unwrap()
            .fields()
            .iter()
            .map(|n| n.value().cloned().unwrap())
            .collect();

        assert_eq!(
            vec![
                Value::Digest(0x41),
                Value::Text("BC".into()),
                Value::Digest(0x44),
            ],
            values,
        );
    }

    #[tokio::test]
    async fn test_async_decoder_failure() {
        let schema = Schema::constructed(
            "record",
            vec![
                Schema::primitive("a", text),
                Schema::primitive_async("b", |_: Vec<u8>| async move {
                    Err::<Value, DecodeError>("bad signature".into())
                }),
            ],
        );

        assert!(matches!(
            schema.parse_async(&RECORD).await,
            Err(Error::Decode { field, .. }) if field == "b"
        ));
    }
}
