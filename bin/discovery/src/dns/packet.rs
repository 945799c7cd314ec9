//! RFC 1035 wire format: query parsing and response building.
//!
//! Only what the server needs: single-question queries, A record
//! answers, and compression-pointer-safe name decoding. Parsing
//! is bounded on every input; no packet causes unbounded work.

use std::net::Ipv4Addr;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: usize = 16;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
  #[error("truncated")]
  Truncated,
  #[error("message is a response, not a query")]
  NotAQuery,
  #[error("expected exactly one question, got {0}")]
  QuestionCount(u16),
  #[error("bad compression pointer")]
  BadPointer,
  #[error("label exceeds {MAX_LABEL_LEN} octets")]
  LabelTooLong,
  #[error("name exceeds {MAX_NAME_LEN} octets")]
  NameTooLong,
}

/// A parsed single-question query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
  pub id: u16,
  /// Recursion desired, echoed into responses.
  pub rd: bool,
  /// Decoded dotted name, no trailing dot.
  pub name: String,
  pub qtype: u16,
  pub qclass: u16,
  /// The question section exactly as received,
  /// echoed byte for byte into responses.
  pub question: Vec<u8>,
}

/// Transaction id, when enough bytes arrived to carry one.
/// Queries too short for this are dropped without a reply.
pub fn transaction_id(buf: &[u8]) -> Option<u16> {
  Some(u16::from_be_bytes([*buf.first()?, *buf.get(1)?]))
}

pub fn parse_query(buf: &[u8]) -> Result<DnsQuery, PacketError> {
  if buf.len() < HEADER_LEN {
    return Err(PacketError::Truncated);
  }
  let id = read_u16(buf, 0);
  let flags = read_u16(buf, 2);
  if flags & 0x8000 != 0 {
    return Err(PacketError::NotAQuery);
  }
  let qdcount = read_u16(buf, 4);
  if qdcount != 1 {
    return Err(PacketError::QuestionCount(qdcount));
  }
  let (name, after_name) = decode_name(buf, HEADER_LEN)?;
  let question_end = after_name
    .checked_add(4)
    .filter(|end| *end <= buf.len())
    .ok_or(PacketError::Truncated)?;
  Ok(DnsQuery {
    id,
    rd: flags & 0x0100 != 0,
    name,
    qtype: read_u16(buf, after_name),
    qclass: read_u16(buf, after_name + 2),
    question: buf[HEADER_LEN..question_end].to_vec(),
  })
}

/// Decode a possibly compressed name starting at `start`.
/// Returns the dotted name and the offset just past it.
///
/// Pointers may only reach strictly earlier bytes, with a bound
/// on total hops, so decoding terminates on every input.
pub fn decode_name(
  buf: &[u8],
  start: usize,
) -> Result<(String, usize), PacketError> {
  let mut labels: Vec<String> = Vec::new();
  let mut pos = start;
  let mut after: Option<usize> = None;
  let mut hops = 0usize;
  let mut name_len = 0usize;
  loop {
    let len_byte =
      *buf.get(pos).ok_or(PacketError::Truncated)?;
    if len_byte & 0xC0 == 0xC0 {
      let second =
        *buf.get(pos + 1).ok_or(PacketError::Truncated)?;
      let target =
        (((len_byte & 0x3F) as usize) << 8) | second as usize;
      if after.is_none() {
        after = Some(pos + 2);
      }
      // Backward only. Also refuses self pointers.
      if target >= pos {
        return Err(PacketError::BadPointer);
      }
      hops += 1;
      if hops > MAX_POINTER_HOPS {
        return Err(PacketError::BadPointer);
      }
      pos = target;
    } else if len_byte & 0xC0 != 0 {
      // 0x40 / 0x80 prefixes are reserved.
      return Err(PacketError::BadPointer);
    } else if len_byte == 0 {
      return Ok((labels.join("."), after.unwrap_or(pos + 1)));
    } else {
      let len = len_byte as usize;
      name_len += len + 1;
      if name_len > MAX_NAME_LEN {
        return Err(PacketError::NameTooLong);
      }
      let label = buf
        .get(pos + 1..pos + 1 + len)
        .ok_or(PacketError::Truncated)?;
      labels.push(String::from_utf8_lossy(label).into_owned());
      pos += 1 + len;
    }
  }
}

/// Encode a dotted name to wire labels, validating bounds.
pub fn encode_name(name: &str) -> Result<Vec<u8>, PacketError> {
  let mut out = Vec::with_capacity(name.len() + 2);
  if !name.is_empty() {
    for label in name.split('.') {
      if label.len() > MAX_LABEL_LEN {
        return Err(PacketError::LabelTooLong);
      }
      out.push(label.len() as u8);
      out.extend_from_slice(label.as_bytes());
    }
  }
  out.push(0);
  if out.len() > MAX_NAME_LEN + 1 {
    return Err(PacketError::NameTooLong);
  }
  Ok(out)
}

/// Build a response echoing the original question section.
/// Flags: QR=1, AA=1, RD as received, RA=0.
pub fn build_response(
  query: &DnsQuery,
  rcode: u8,
  answers: &[Ipv4Addr],
  ttl: u32,
) -> Vec<u8> {
  let mut out = Vec::with_capacity(
    HEADER_LEN + query.question.len() + answers.len() * 16,
  );
  out.extend_from_slice(&query.id.to_be_bytes());
  let mut flags: u16 = 0x8000 | 0x0400 | (rcode as u16 & 0x000F);
  if query.rd {
    flags |= 0x0100;
  }
  out.extend_from_slice(&flags.to_be_bytes());
  out.extend_from_slice(&1u16.to_be_bytes());
  out.extend_from_slice(&(answers.len() as u16).to_be_bytes());
  out.extend_from_slice(&0u16.to_be_bytes());
  out.extend_from_slice(&0u16.to_be_bytes());
  out.extend_from_slice(&query.question);
  for ip in answers {
    // Compression pointer back to the question name.
    out.extend_from_slice(&[0xC0, 0x0C]);
    out.extend_from_slice(&TYPE_A.to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    out.extend_from_slice(&ttl.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&ip.octets());
  }
  out
}

/// Bare SERVFAIL for packets whose question could not be parsed
/// but whose transaction id survived.
pub fn build_servfail(id: u16) -> Vec<u8> {
  let mut out = Vec::with_capacity(HEADER_LEN);
  out.extend_from_slice(&id.to_be_bytes());
  out.extend_from_slice(
    &(0x8000u16 | RCODE_SERVFAIL as u16).to_be_bytes(),
  );
  out.extend_from_slice(&[0; 8]);
  out
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
  u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[cfg(test)]
pub fn build_query(
  id: u16,
  name: &str,
  qtype: u16,
) -> Vec<u8> {
  let mut out = Vec::new();
  out.extend_from_slice(&id.to_be_bytes());
  out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
  out.extend_from_slice(&1u16.to_be_bytes());
  out.extend_from_slice(&[0; 6]);
  out.extend_from_slice(&encode_name(name).unwrap());
  out.extend_from_slice(&qtype.to_be_bytes());
  out.extend_from_slice(&CLASS_IN.to_be_bytes());
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_and_reencode_question_is_byte_identical() {
    let buf = build_query(0x1234, "casa-api.jiji", TYPE_A);
    let query = parse_query(&buf).unwrap();
    assert_eq!(query.id, 0x1234);
    assert!(query.rd);
    assert_eq!(query.name, "casa-api.jiji");
    assert_eq!(query.qtype, TYPE_A);
    assert_eq!(query.qclass, CLASS_IN);

    let mut reencoded = encode_name(&query.name).unwrap();
    reencoded.extend_from_slice(&query.qtype.to_be_bytes());
    reencoded.extend_from_slice(&query.qclass.to_be_bytes());
    assert_eq!(reencoded, query.question);
  }

  #[test]
  fn response_is_a_rejected() {
    let mut buf = build_query(1, "a.jiji", TYPE_A);
    buf[2] |= 0x80; // QR
    assert_eq!(parse_query(&buf), Err(PacketError::NotAQuery));
  }

  #[test]
  fn question_count_must_be_one() {
    let mut buf = build_query(1, "a.jiji", TYPE_A);
    buf[5] = 2;
    assert_eq!(
      parse_query(&buf),
      Err(PacketError::QuestionCount(2))
    );
    buf[5] = 0;
    assert_eq!(
      parse_query(&buf),
      Err(PacketError::QuestionCount(0))
    );
  }

  #[test]
  fn short_packets_are_truncated() {
    assert_eq!(parse_query(&[]), Err(PacketError::Truncated));
    assert_eq!(
      parse_query(&[0x12, 0x34, 0, 0]),
      Err(PacketError::Truncated)
    );
    // Name runs past the end of the buffer.
    let mut buf = build_query(1, "abc.jiji", TYPE_A);
    buf.truncate(14);
    assert_eq!(parse_query(&buf), Err(PacketError::Truncated));
  }

  #[test]
  fn transaction_id_needs_two_bytes() {
    assert_eq!(transaction_id(&[0x12]), None);
    assert_eq!(transaction_id(&[0x12, 0x34]), Some(0x1234));
  }

  #[test]
  fn self_pointer_is_refused() {
    let mut buf = vec![0u8; 14];
    buf[5] = 1; // qdcount
    buf[12] = 0xC0;
    buf[13] = 12; // points at itself
    assert_eq!(parse_query(&buf), Err(PacketError::BadPointer));
  }

  #[test]
  fn forward_pointer_is_refused() {
    let mut buf = vec![0u8; 20];
    buf[5] = 1;
    buf[12] = 0xC0;
    buf[13] = 14; // points forward
    assert_eq!(parse_query(&buf), Err(PacketError::BadPointer));
  }

  #[test]
  fn pointer_missing_second_byte_is_truncated() {
    let mut buf = vec![0u8; 13];
    buf[5] = 1;
    buf[12] = 0xC0;
    assert_eq!(parse_query(&buf), Err(PacketError::Truncated));
  }

  #[test]
  fn pointer_chains_are_bounded() {
    // A long chain of strictly backward pointers, then the
    // question name pointing at the chain head.
    let mut buf = vec![0u8; 12];
    buf[5] = 1;
    // 20 pointer hops laid out back to back after the header.
    let chain_start = buf.len();
    for i in 0..20usize {
      let offset = chain_start + i * 2;
      if i == 0 {
        // Chain tail: root label.
        buf.extend_from_slice(&[0, 0]);
      } else {
        let target = (chain_start + (i - 1) * 2) as u16;
        buf.extend_from_slice(&[
          0xC0 | (target >> 8) as u8,
          (target & 0xFF) as u8,
        ]);
      }
      assert_eq!(offset + 2, buf.len());
    }
    // Question name: pointer to the last chain entry.
    let head = (chain_start + 19 * 2) as u16;
    buf.extend_from_slice(&[
      0xC0 | (head >> 8) as u8,
      (head & 0xFF) as u8,
    ]);
    buf.extend_from_slice(&TYPE_A.to_be_bytes());
    buf.extend_from_slice(&CLASS_IN.to_be_bytes());
    // 20 hops exceeds the bound; parsing still terminates.
    assert_eq!(parse_query(&buf), Err(PacketError::BadPointer));
  }

  #[test]
  fn oversized_names_are_refused() {
    let long = vec!["a".repeat(63); 5].join(".");
    assert_eq!(
      encode_name(&long),
      Err(PacketError::NameTooLong)
    );
    assert_eq!(
      encode_name(&"a".repeat(64)),
      Err(PacketError::LabelTooLong)
    );
  }

  #[test]
  fn response_flags_and_answers() {
    let buf = build_query(0xBEEF, "casa-api.jiji", TYPE_A);
    let query = parse_query(&buf).unwrap();
    let response = build_response(
      &query,
      RCODE_NOERROR,
      &[Ipv4Addr::new(10, 210, 1, 5)],
      60,
    );
    assert_eq!(&response[0..2], &[0xBE, 0xEF]);
    let flags = u16::from_be_bytes([response[2], response[3]]);
    assert_ne!(flags & 0x8000, 0, "QR set");
    assert_ne!(flags & 0x0400, 0, "AA set");
    assert_ne!(flags & 0x0100, 0, "RD echoed");
    assert_eq!(flags & 0x0080, 0, "RA clear");
    assert_eq!(flags & 0x000F, 0, "NOERROR");
    // qdcount 1, ancount 1
    assert_eq!(&response[4..8], &[0, 1, 0, 1]);
    // Question echoed byte for byte.
    assert_eq!(
      &response[12..12 + query.question.len()],
      query.question.as_slice()
    );
    // Answer: pointer, type, class, ttl, rdlength, ip.
    let answer = &response[12 + query.question.len()..];
    assert_eq!(&answer[0..2], &[0xC0, 0x0C]);
    assert_eq!(&answer[2..4], &TYPE_A.to_be_bytes());
    assert_eq!(&answer[4..6], &CLASS_IN.to_be_bytes());
    assert_eq!(&answer[6..10], &60u32.to_be_bytes());
    assert_eq!(&answer[10..12], &[0, 4]);
    assert_eq!(&answer[12..16], &[10, 210, 1, 5]);
  }

  #[test]
  fn nxdomain_response_has_no_answers() {
    let buf = build_query(7, "missing.jiji", TYPE_A);
    let query = parse_query(&buf).unwrap();
    let response =
      build_response(&query, RCODE_NXDOMAIN, &[], 60);
    let flags = u16::from_be_bytes([response[2], response[3]]);
    assert_eq!(flags & 0x000F, RCODE_NXDOMAIN as u16);
    assert_eq!(&response[6..8], &[0, 0]);
  }

  #[test]
  fn servfail_without_question() {
    let response = build_servfail(0x0102);
    assert_eq!(&response[0..2], &[0x01, 0x02]);
    let flags = u16::from_be_bytes([response[2], response[3]]);
    assert_ne!(flags & 0x8000, 0);
    assert_eq!(flags & 0x000F, RCODE_SERVFAIL as u16);
    assert_eq!(&response[4..6], &[0, 0]);
  }
}
