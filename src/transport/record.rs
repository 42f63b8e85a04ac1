//! Request record layout shared by listener services and the transport.
//!
//! A listener service writes one record per request into the receive buffer.
//! All integers are little-endian:
//!
//! ```text
//! u64  request id
//! u32  verb length        | verb bytes
//! u32  target length      | target bytes (path and optional "?query")
//! u32  header count
//!      u32 name length    | name bytes
//!      u32 value length   | value bytes      (repeated per header)
//! u32  body length        | body bytes
//! ```
//!
//! [`RequestRecord::parse`] validates the layout once and keeps byte ranges,
//! so every accessor afterwards is a slice of the shared buffer.

use std::ops::Range;
use std::str;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::RawRequestId;
use crate::http::{HeaderView, Method, QueryParams};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record truncated at byte {offset}")]
    Truncated { offset: usize },

    #[error("{field} at byte {offset} is not valid UTF-8")]
    Utf8 { field: &'static str, offset: usize },

    #[error("{trailing} trailing bytes after record")]
    Trailing { trailing: usize },
}

/// The pieces a listener service encodes into a record.
#[derive(Debug, Clone, Copy)]
pub struct RecordParts<'a> {
    pub request_id: RawRequestId,
    pub verb: &'a str,
    pub target: &'a str,
    pub headers: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
}

impl RecordParts<'_> {
    /// Exact number of bytes [`encode`](Self::encode) writes.
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| 8 + name.len() + value.len())
            .sum();
        8 + 4 + self.verb.len() + 4 + self.target.len() + 4 + headers + 4 + self.body.len()
    }

    /// Appends the record to `buf`.
    ///
    /// Returns the encoded length, or the required length if it exceeds
    /// `limit`, in which case `buf` is left untouched.
    pub fn encode(&self, buf: &mut BytesMut, limit: usize) -> Result<usize, usize> {
        let len = self.encoded_len();
        if len > limit || len > u32::MAX as usize {
            return Err(len);
        }

        buf.reserve(len);
        buf.put_u64_le(self.request_id);
        put_field(buf, self.verb.as_bytes());
        put_field(buf, self.target.as_bytes());
        buf.put_u32_le(self.headers.len() as u32);
        for (name, value) in self.headers {
            put_field(buf, name.as_bytes());
            put_field(buf, value.as_bytes());
        }
        put_field(buf, self.body);
        Ok(len)
    }
}

fn put_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<Range<usize>, RecordError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(RecordError::Truncated { offset: self.pos })?;
        let range = self.pos..end;
        self.pos = end;
        Ok(range)
    }

    fn u32(&mut self) -> Result<u32, RecordError> {
        let range = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[range]);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, RecordError> {
        let range = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[range]);
        Ok(u64::from_le_bytes(raw))
    }

    fn bytes(&mut self) -> Result<Range<usize>, RecordError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn text(&mut self, field: &'static str) -> Result<Text, RecordError> {
        let range = self.bytes()?;
        str::from_utf8(&self.buf[range.clone()]).map_err(|_| RecordError::Utf8 {
            field,
            offset: range.start,
        })?;
        Ok(Text(range))
    }
}

/// Byte range of a record field already checked to be UTF-8.
///
/// Only [`Reader::text`] creates one, or a split of one at an ASCII byte.
#[derive(Debug, Clone)]
struct Text(Range<usize>);

/// A parsed request record backed by a shared receive buffer.
///
/// Cloning is cheap: the buffer is reference-counted and only the offset
/// table is copied.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    data: Bytes,
    request_id: RawRequestId,
    verb: Text,
    path: Text,
    query: Option<Text>,
    headers: Vec<(Text, Text)>,
    body: Range<usize>,
}

impl RequestRecord {
    pub fn parse(data: Bytes) -> Result<Self, RecordError> {
        let mut reader = Reader {
            buf: &data[..],
            pos: 0,
        };

        let request_id = reader.u64()?;
        let verb = reader.text("verb")?;
        let target = reader.text("target")?;

        let count = reader.u32()? as usize;
        // Each header occupies at least eight bytes; don't trust `count` for
        // the allocation.
        let mut headers = Vec::with_capacity(count.min(data.len() / 8));
        for _ in 0..count {
            let name = reader.text("header name")?;
            let value = reader.text("header value")?;
            headers.push((name, value));
        }

        let body = reader.bytes()?;
        if reader.pos != data.len() {
            return Err(RecordError::Trailing {
                trailing: data.len() - reader.pos,
            });
        }

        let Text(target) = target;
        let (path, query) = match data[target.clone()].iter().position(|b| *b == b'?') {
            Some(at) => (
                Text(target.start..target.start + at),
                Some(Text(target.start + at + 1..target.end)),
            ),
            None => (Text(target), None),
        };

        Ok(Self {
            data,
            request_id,
            verb,
            path,
            query,
            headers,
            body,
        })
    }

    fn text(&self, text: &Text) -> &str {
        let bytes = &self.data[text.0.clone()];
        // SAFETY: every `Text` was checked by `str::from_utf8` in `parse`, or
        // split from one at an ASCII byte, and `data` is immutable.
        unsafe { str::from_utf8_unchecked(bytes) }
    }

    pub fn request_id(&self) -> RawRequestId {
        self.request_id
    }

    pub fn method(&self) -> Method {
        self.text(&self.verb)
            .parse()
            .unwrap_or_else(|never| match never {})
    }

    pub fn path(&self) -> &str {
        self.text(&self.path)
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_ref().map(|text| self.text(text))
    }

    pub fn headers(&self) -> HeaderView<'_> {
        HeaderView::from_entries(
            self.headers
                .iter()
                .map(|(name, value)| (self.text(name), self.text(value)))
                .collect(),
        )
    }

    pub fn query_params(&self) -> QueryParams<'_> {
        self.query().map(QueryParams::parse).unwrap_or_default()
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.body.clone()]
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gives back the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(parts: &RecordParts<'_>) -> Bytes {
        let mut buf = BytesMut::new();
        parts.encode(&mut buf, usize::MAX).unwrap();
        buf.freeze()
    }

    fn sample<'a>(headers: &'a [(&'a str, &'a str)]) -> RecordParts<'a> {
        RecordParts {
            request_id: 7,
            verb: "POST",
            target: "/api/player/play?index=3&columns=%25title%25",
            headers,
            body: b"{\"volume\":-6}",
        }
    }

    #[test]
    fn views_slice_the_record() {
        let headers = [("Host", "player.local"), ("X-Tag", "a"), ("x-tag", "b")];
        let parts = sample(&headers);
        let bytes = encode(&parts);
        assert_eq!(bytes.len(), parts.encoded_len());

        let record = RequestRecord::parse(bytes).unwrap();
        assert_eq!(record.request_id(), 7);
        assert_eq!(record.method(), Method::Post);
        assert_eq!(record.path(), "/api/player/play");
        assert_eq!(record.query(), Some("index=3&columns=%25title%25"));
        assert_eq!(record.query_params().get("columns"), Some("%title%"));
        assert_eq!(record.body(), b"{\"volume\":-6}");

        let view = record.headers();
        assert_eq!(view.len(), 3);
        assert_eq!(view.get_all("X-TAG").collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn target_without_query() {
        let parts = RecordParts {
            request_id: 1,
            verb: "GET",
            target: "/api/artwork",
            headers: &[],
            body: b"",
        };
        let record = RequestRecord::parse(encode(&parts)).unwrap();
        assert_eq!(record.path(), "/api/artwork");
        assert_eq!(record.query(), None);
        assert!(record.query_params().is_empty());
        assert!(record.body().is_empty());
    }

    #[test]
    fn multibyte_text_is_sliced_on_char_boundaries() {
        let headers = [("X-Title", "Café – Ölfarben ♪")];
        let parts = RecordParts {
            request_id: 2,
            verb: "GET",
            target: "/api/library/Björk?album=Homogénic",
            headers: &headers,
            body: b"",
        };
        let record = RequestRecord::parse(encode(&parts)).unwrap();
        assert_eq!(record.path(), "/api/library/Björk");
        assert_eq!(record.query(), Some("album=Homogénic"));
        assert_eq!(record.headers().get("x-title"), Some("Café – Ölfarben ♪"));

        let copy = record.clone();
        assert_eq!(copy.path(), record.path());
    }

    #[test]
    fn encode_respects_limit() {
        let parts = sample(&[]);
        let mut buf = BytesMut::new();
        let needed = parts.encoded_len();
        assert_eq!(parts.encode(&mut buf, needed - 1), Err(needed));
        assert!(buf.is_empty());
        assert_eq!(parts.encode(&mut buf, needed), Ok(needed));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = encode(&sample(&[("Host", "x")]));
        let cut = bytes.slice(..bytes.len() - 3);
        assert!(matches!(
            RequestRecord::parse(cut),
            Err(RecordError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut buf = BytesMut::new();
        sample(&[]).encode(&mut buf, usize::MAX).unwrap();
        buf.put_u8(0);
        assert_eq!(
            RequestRecord::parse(buf.freeze()).unwrap_err(),
            RecordError::Trailing { trailing: 1 }
        );
    }

    #[test]
    fn invalid_utf8_header_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        put_field(&mut buf, b"GET");
        put_field(&mut buf, b"/");
        buf.put_u32_le(1);
        put_field(&mut buf, b"X-Bad");
        put_field(&mut buf, &[0xff, 0xfe]);
        put_field(&mut buf, b"");
        assert!(matches!(
            RequestRecord::parse(buf.freeze()),
            Err(RecordError::Utf8 { field: "header value", .. })
        ));
    }
}
