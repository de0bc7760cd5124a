//! URL query string parsing.

use memchr::memchr;

/// Splits a raw query string into ordered (name, value) pairs.
///
/// Handles an optional leading `?`. A segment without `=` becomes a name
/// with an empty value; empty segments between `&` are kept as empty pairs,
/// matching what the wire actually carried. No percent-decoding is applied.
///
/// Parsing stops once `limit` pairs have been collected; the remainder of
/// the query is ignored rather than failing the request.
pub(crate) fn parse_into(result: &mut Vec<(String, String)>, query: &[u8], limit: usize) {
    let data = match query.first() {
        Some(b'?') => &query[1..],
        Some(_) => query,
        None => return,
    };

    let mut start = 0;
    while start < data.len() {
        if result.len() >= limit {
            return;
        }

        let end = memchr(b'&', &data[start..])
            .map(|pos| start + pos)
            .unwrap_or(data.len());

        let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
        let split_index = start + index;

        let name = &data[start..split_index];
        let value = match split_index < end {
            true => &data[split_index + 1..end],
            false => b"" as &[u8],
        };

        result.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
        start = end + 1;
    }
}
