//! DNS wire framing and QNAME extraction for logging.
//!
//! This is the only place the forwarder looks inside a DNS message; it never
//! inspects anything beyond the first question, and a parse failure here is
//! fatal for the query (spec.md §4.4, §7).

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;

use crate::error::Error;

/// Prepend a 2-byte big-endian length prefix to a bare UDP DNS message,
/// matching the TCP-style framing the wire protocol to the ioserver expects.
pub fn frame_udp_payload(message: &[u8]) -> Vec<u8> {
    let len = message.len() as u16;
    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

/// Strip the 2-byte length prefix the ioserver's reply carries, returning
/// the bare DNS message to `sendto` back to the UDP client.
pub fn strip_udp_prefix(framed: &[u8]) -> Result<&[u8], Error> {
    if framed.len() < 2 {
        return Err(Error::ParseFail("response shorter than length prefix".into()));
    }
    Ok(&framed[2..])
}

/// Extract the first question's name, for logging only. A client TCP
/// message is length-prefixed; this expects the *unprefixed* message bytes
/// (callers strip the 2-byte TCP prefix before calling, the same bytes used
/// for the UDP path before `frame_udp_payload` is applied).
pub fn extract_qname(message: &[u8]) -> Result<String, Error> {
    let parsed = Message::from_bytes(message)
        .map_err(|e| Error::ParseFail(format!("malformed DNS message: {e}")))?;
    parsed
        .queries()
        .first()
        .map(|q| q.name().to_string())
        .ok_or_else(|| Error::ParseFail("no question in DNS message".into()))
}
