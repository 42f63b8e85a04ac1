//! The request/response capability every transport backend implements.

use std::borrow::Cow;
use std::fmt;

use super::{Body, HeaderView, Method, Response};

/// Identifies one client request within a listener.
///
/// A token names a pool slot and the generation of that slot at the time the
/// request was received, so a token outlives neither a recycled slot nor a
/// later request on the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
}

impl RequestToken {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// One in-flight client request, independent of the backend that received it.
///
/// The accessors return views into transport-owned memory and are cheap to
/// call repeatedly. After [`release_resources`](Self::release_resources) they
/// return empty values.
///
/// Responses are streamed in one of two shapes:
///
/// - [`send_response`](Self::send_response) for a complete response, or
/// - [`send_response_begin`](Self::send_response_begin), any number of
///   [`send_response_body`](Self::send_response_body) calls, then
///   [`send_response_end`](Self::send_response_end).
///
/// Chunks are transmitted strictly in call order.
pub trait RequestCore: Send {
    fn token(&self) -> RequestToken;

    fn method(&self) -> Method;

    /// The request path without the query string.
    fn path(&self) -> &str;

    fn headers(&self) -> HeaderView<'_>;

    fn query_params(&self) -> QueryParams<'_>;

    fn body(&self) -> &[u8];

    fn send_response(&mut self, response: Response);

    fn send_response_begin(&mut self, response: Response);

    fn send_response_body(&mut self, chunk: Body);

    fn send_response_end(&mut self);

    /// Abandons the request from any state. The transport still recycles the
    /// request once every outstanding operation has completed.
    fn abort(&mut self);

    /// Drops this handle's references to the receive buffer.
    fn release_resources(&mut self);
}

/// Decoded query-string parameters in their original order.
///
/// Values without percent escapes or `+` borrow from the request.
///
/// # Examples
///
/// ```
/// use playwire::http::QueryParams;
///
/// let params = QueryParams::parse("columns=%25artist%25&player=main+output&flag");
/// assert_eq!(params.get("columns"), Some("%artist%"));
/// assert_eq!(params.get("player"), Some("main output"));
/// assert_eq!(params.get("flag"), Some(""));
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryParams<'a> {
    pairs: Vec<(Cow<'a, str>, Cow<'a, str>)>,
}

impl<'a> QueryParams<'a> {
    /// Splits `key=value&key2=value2`; empty segments are skipped.
    pub fn parse(query: &'a str) -> Self {
        let pairs = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next().unwrap_or("");
                let value = parts.next().unwrap_or("");
                (decode_component(key), decode_component(value))
            })
            .collect();
        Self { pairs }
    }

    /// Returns the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    pub fn get_all<'s>(&'s self, key: &'s str) -> impl Iterator<Item = &'s str> + 's {
        self.pairs
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_ref(), v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

// `+` becomes a space, `%XX` is decoded, malformed escapes are kept verbatim.
fn decode_component(s: &str) -> Cow<'_, str> {
    if !s.contains(['%', '+']) {
        return Cow::Borrowed(s);
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_borrow() {
        let params = QueryParams::parse("a=1&b=two");
        assert_eq!(params.len(), 2);
        assert!(matches!(params.pairs[1].1, Cow::Borrowed("two")));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let params = QueryParams::parse("p=1&q=x&p=2");
        let all: Vec<_> = params.get_all("p").collect();
        assert_eq!(all, vec!["1", "2"]);
        assert_eq!(params.get("p"), Some("1"));
    }

    #[test]
    fn malformed_escape_kept() {
        let params = QueryParams::parse("q=100%&r=%zz&s=%4");
        assert_eq!(params.get("q"), Some("100%"));
        assert_eq!(params.get("r"), Some("%zz"));
        assert_eq!(params.get("s"), Some("%4"));
    }

    #[test]
    fn escaped_key() {
        let params = QueryParams::parse("sort%5Bby%5D=title");
        assert_eq!(params.get("sort[by]"), Some("title"));
    }

    #[test]
    fn empty_query() {
        assert!(QueryParams::parse("").is_empty());
        assert!(QueryParams::parse("&&").is_empty());
    }
}
