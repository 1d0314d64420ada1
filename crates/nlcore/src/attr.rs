//! Netlink attribute (nlattr) handling: iteration, typed access, policy
//! validation and construction.

use std::mem;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};
use crate::message::Message;

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = nla_align(mem::size_of::<NlAttr>());

/// Netlink attribute header (mirrors struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Check if this is a nested attribute.
    pub fn is_nested(&self) -> bool {
        self.nla_type & NLA_F_NESTED != 0
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nla_len as usize).saturating_sub(NLA_HDRLEN)
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Iterator over netlink attributes in a buffer.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Check if there are no more attributes.
    pub fn is_empty(&self) -> bool {
        self.data.len() < NLA_HDRLEN
    }

    /// Find the first attribute of the given type.
    pub fn find(self, attr_type: u16) -> Option<&'a [u8]> {
        let mut iter = self;
        iter.find_map(|(ty, data)| (ty == attr_type).then_some(data))
    }
}

impl<'a> Iterator for AttrIter<'a> {
    /// Returns (attribute type, payload data).
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let attr = match NlAttr::from_bytes(self.data) {
            Ok(a) => a,
            Err(_) => return None,
        };

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned_len = nla_align(len);

        // Move to next attribute
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some((attr.kind(), payload))
    }
}

/// Expected payload shape of an attribute, for policy validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttrDataType {
    /// No format expectation.
    #[default]
    Unspec,
    U8,
    U16,
    U32,
    U64,
    /// Presence-only attribute, empty payload.
    Flag,
    /// NUL-terminated string.
    String,
    /// Carries further attributes.
    Nested,
}

impl AttrDataType {
    fn min_size(self) -> usize {
        match self {
            AttrDataType::Unspec | AttrDataType::Flag => 0,
            AttrDataType::U8 => 1,
            AttrDataType::U16 => 2,
            AttrDataType::U32 => 4,
            AttrDataType::U64 => 8,
            AttrDataType::String => 1,
            AttrDataType::Nested => NLA_HDRLEN,
        }
    }
}

/// Validation policy for one attribute type.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrPolicy {
    /// Expected payload shape.
    pub kind: AttrDataType,
    /// Minimum payload length, 0 defers to the shape's natural minimum.
    pub min_len: usize,
    /// Maximum payload length, 0 for unbounded.
    pub max_len: usize,
}

fn validate_one(attr_type: u16, policy: &AttrPolicy, data: &[u8]) -> Result<()> {
    let min = if policy.min_len > 0 {
        policy.min_len
    } else {
        policy.kind.min_size()
    };

    if data.len() < min {
        return Err(Error::InvalidAttribute(format!(
            "attribute {attr_type}: payload of {} octets, expected at least {min}",
            data.len()
        )));
    }
    if policy.max_len > 0 && data.len() > policy.max_len {
        return Err(Error::InvalidAttribute(format!(
            "attribute {attr_type}: payload of {} octets exceeds {}",
            data.len(),
            policy.max_len
        )));
    }

    match policy.kind {
        AttrDataType::Flag if !data.is_empty() => Err(Error::InvalidAttribute(format!(
            "attribute {attr_type}: flag attribute carries payload"
        ))),
        AttrDataType::String if data.last() != Some(&0) => Err(Error::InvalidAttribute(format!(
            "attribute {attr_type}: string not NUL-terminated"
        ))),
        _ => Ok(()),
    }
}

/// Validate an attribute stream against a policy without collecting it.
pub fn validate(data: &[u8], maxtype: u16, policy: &[AttrPolicy]) -> Result<()> {
    for (ty, payload) in AttrIter::new(data) {
        if ty == 0 || ty > maxtype {
            continue;
        }
        if let Some(p) = policy.get(ty as usize) {
            validate_one(ty, p, payload)?;
        }
    }
    Ok(())
}

/// Parse an attribute stream into a type-indexed table.
///
/// Attributes with type 0 or above `maxtype` are silently ignored, a later
/// attribute of the same type replaces an earlier one. When a policy is
/// supplied each accepted attribute is validated against its entry.
pub fn parse<'a>(
    data: &'a [u8],
    maxtype: u16,
    policy: Option<&[AttrPolicy]>,
) -> Result<Vec<Option<&'a [u8]>>> {
    let mut tb: Vec<Option<&'a [u8]>> = vec![None; maxtype as usize + 1];

    for (ty, payload) in AttrIter::new(data) {
        if ty == 0 || ty > maxtype {
            continue;
        }
        if let Some(policy) = policy {
            if let Some(p) = policy.get(ty as usize) {
                validate_one(ty, p, payload)?;
            }
        }
        tb[ty as usize] = Some(payload);
    }

    Ok(tb)
}

/// Helper functions for extracting typed values from attribute payloads.
pub mod get {
    use super::*;

    /// Extract a u8 value.
    pub fn u8(data: &[u8]) -> Result<u8> {
        if data.is_empty() {
            return Err(Error::InvalidAttribute("empty u8 attribute".into()));
        }
        Ok(data[0])
    }

    /// Extract a u16 value (native endian).
    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_ne_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (native endian).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a u64 value (native endian).
    pub fn u64_ne(data: &[u8]) -> Result<u64> {
        if data.len() < 8 {
            return Err(Error::InvalidAttribute("truncated u64 attribute".into()));
        }
        Ok(u64::from_ne_bytes([
            data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
        ]))
    }

    /// Extract an i32 value (native endian).
    pub fn i32_ne(data: &[u8]) -> Result<i32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated i32 attribute".into()));
        }
        Ok(i32::from_ne_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a u16 value (big endian / network order).
    pub fn u16_be(data: &[u8]) -> Result<u16> {
        if data.len() < 2 {
            return Err(Error::InvalidAttribute("truncated u16 attribute".into()));
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Extract a u32 value (big endian / network order).
    pub fn u32_be(data: &[u8]) -> Result<u32> {
        if data.len() < 4 {
            return Err(Error::InvalidAttribute("truncated u32 attribute".into()));
        }
        Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Extract a NUL-terminated string.
    pub fn string(data: &[u8]) -> Result<&str> {
        let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {e}")))
    }

    /// Extract raw bytes (no interpretation).
    pub fn bytes(data: &[u8]) -> &[u8] {
        data
    }
}

/// Token returned when starting a nested attribute, used to finalize the
/// nested attribute length.
#[derive(Debug, Clone, Copy)]
pub struct NestToken {
    /// Offset of the nested attribute header in the message buffer.
    offset: usize,
}

impl Message {
    /// Append an attribute with the given type and payload.
    pub fn put_attr(&mut self, attr_type: u16, data: &[u8]) -> Result<()> {
        if NLA_HDRLEN + data.len() > u16::MAX as usize {
            return Err(Error::InvalidAttribute(format!(
                "attribute {attr_type} payload of {} octets does not fit",
                data.len()
            )));
        }

        let attr = NlAttr::new(attr_type, data.len());
        let room = self.reserve(NLA_HDRLEN + data.len(), NLA_ALIGNTO);
        room[..NLA_HDRLEN].copy_from_slice(attr.as_bytes());
        room[NLA_HDRLEN..].copy_from_slice(data);
        Ok(())
    }

    /// Append a u8 attribute.
    pub fn put_attr_u8(&mut self, attr_type: u16, value: u8) -> Result<()> {
        self.put_attr(attr_type, &[value])
    }

    /// Append a u16 attribute (native endian).
    pub fn put_attr_u16(&mut self, attr_type: u16, value: u16) -> Result<()> {
        self.put_attr(attr_type, &value.to_ne_bytes())
    }

    /// Append a u32 attribute (native endian).
    pub fn put_attr_u32(&mut self, attr_type: u16, value: u32) -> Result<()> {
        self.put_attr(attr_type, &value.to_ne_bytes())
    }

    /// Append a u64 attribute (native endian).
    pub fn put_attr_u64(&mut self, attr_type: u16, value: u64) -> Result<()> {
        self.put_attr(attr_type, &value.to_ne_bytes())
    }

    /// Append a u16 attribute (big endian / network order).
    pub fn put_attr_u16_be(&mut self, attr_type: u16, value: u16) -> Result<()> {
        self.put_attr(attr_type, &value.to_be_bytes())
    }

    /// Append a u32 attribute (big endian / network order).
    pub fn put_attr_u32_be(&mut self, attr_type: u16, value: u32) -> Result<()> {
        self.put_attr(attr_type, &value.to_be_bytes())
    }

    /// Append a NUL-terminated string attribute.
    pub fn put_attr_str(&mut self, attr_type: u16, value: &str) -> Result<()> {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.put_attr(attr_type, &data)
    }

    /// Append an empty (flag) attribute.
    pub fn put_attr_flag(&mut self, attr_type: u16) -> Result<()> {
        self.put_attr(attr_type, &[])
    }

    /// Start a nested attribute. Returns a token for [`nest_end`](Message::nest_end).
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.header().nlmsg_len as usize;
        let attr = NlAttr::new(attr_type | NLA_F_NESTED, 0);
        self.reserve(NLA_HDRLEN, NLA_ALIGNTO)
            .copy_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// Close a nested attribute started with [`nest_start`](Message::nest_start),
    /// fixing up its length to cover everything appended in between.
    pub fn nest_end(&mut self, token: NestToken) {
        let len = self.header().nlmsg_len as usize - token.offset;
        let bytes = (len as u16).to_ne_bytes();
        let buf = self.buf_mut();
        buf[token.offset] = bytes[0];
        buf[token.offset + 1] = bytes[1];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::NLMSG_HDRLEN;

    #[test]
    fn test_attr_align() {
        assert_eq!(nla_align(0), 0);
        assert_eq!(nla_align(3), 4);
        assert_eq!(nla_align(4), 4);
        assert_eq!(NLA_HDRLEN, 4);
    }

    #[test]
    fn test_put_and_iterate() {
        let mut msg = Message::new_simple(16, 0);
        msg.put_attr_u32(1, 0x12345678).unwrap();
        msg.put_attr_str(3, "lo").unwrap();
        msg.put_attr_u8(4, 9).unwrap();

        let attrs: Vec<_> = AttrIter::new(msg.attr_data(0)).collect();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].0, 1);
        assert_eq!(get::u32_ne(attrs[0].1).unwrap(), 0x12345678);
        assert_eq!(get::string(attrs[1].1).unwrap(), "lo");
        assert_eq!(get::u8(attrs[2].1).unwrap(), 9);
    }

    #[test]
    fn test_attr_padding_alignment() {
        let mut msg = Message::new_simple(16, 0);
        msg.put_attr(1, &[0xff]).unwrap();
        msg.put_attr_u32(2, 7).unwrap();

        // first attribute occupies an aligned 8 octets (4 header + 1 + 3 pad)
        assert_eq!(msg.payload_len(), 8 + 8);
        let second = AttrIter::new(msg.attr_data(0)).find(2).unwrap();
        assert_eq!(get::u32_ne(second).unwrap(), 7);
    }

    #[test]
    fn test_nested_attributes() {
        let mut msg = Message::new_simple(16, 0);
        let nest = msg.nest_start(5);
        msg.put_attr_u32(1, 100).unwrap();
        msg.put_attr_u16(2, 200).unwrap();
        msg.nest_end(nest);
        msg.put_attr_u8(6, 1).unwrap();

        let mut iter = AttrIter::new(msg.attr_data(0));
        let (ty, nested) = iter.next().unwrap();
        assert_eq!(ty, 5);

        let raw = NlAttr::from_bytes(&msg.as_bytes()[NLMSG_HDRLEN..]).unwrap();
        assert!(raw.is_nested());

        let inner: Vec<_> = AttrIter::new(nested).collect();
        assert_eq!(inner.len(), 2);
        assert_eq!(get::u32_ne(inner[0].1).unwrap(), 100);
        assert_eq!(get::u16_ne(inner[1].1).unwrap(), 200);

        let (ty, data) = iter.next().unwrap();
        assert_eq!(ty, 6);
        assert_eq!(get::u8(data).unwrap(), 1);
    }

    #[test]
    fn test_parse_table() {
        let mut msg = Message::new_simple(16, 0);
        msg.put_attr_u32(2, 42).unwrap();
        msg.put_attr_str(4, "eth0").unwrap();
        msg.put_attr_u32(9, 1).unwrap(); // above maxtype, ignored

        let tb = parse(msg.attr_data(0), 4, None).unwrap();
        assert_eq!(tb.len(), 5);
        assert!(tb[1].is_none());
        assert_eq!(get::u32_ne(tb[2].unwrap()).unwrap(), 42);
        assert_eq!(get::string(tb[4].unwrap()).unwrap(), "eth0");
    }

    #[test]
    fn test_parse_with_policy() {
        let mut msg = Message::new_simple(16, 0);
        msg.put_attr_u8(1, 3).unwrap();

        let policy = [
            AttrPolicy::default(),
            AttrPolicy {
                kind: AttrDataType::U32,
                ..Default::default()
            },
        ];
        // a one-octet payload fails a u32 policy
        assert!(matches!(
            parse(msg.attr_data(0), 1, Some(&policy)),
            Err(Error::InvalidAttribute(_))
        ));

        let mut msg = Message::new_simple(16, 0);
        msg.put_attr_u32(1, 3).unwrap();
        let tb = parse(msg.attr_data(0), 1, Some(&policy)).unwrap();
        assert_eq!(get::u32_ne(tb[1].unwrap()).unwrap(), 3);
    }

    #[test]
    fn test_policy_string_and_flag() {
        let mut msg = Message::new_simple(16, 0);
        msg.put_attr(1, b"name").unwrap(); // not NUL-terminated
        let policy = [
            AttrPolicy::default(),
            AttrPolicy {
                kind: AttrDataType::String,
                ..Default::default()
            },
        ];
        assert!(validate(msg.attr_data(0), 1, &policy).is_err());

        let mut msg = Message::new_simple(16, 0);
        msg.put_attr_flag(1).unwrap();
        let policy = [
            AttrPolicy::default(),
            AttrPolicy {
                kind: AttrDataType::Flag,
                ..Default::default()
            },
        ];
        assert!(validate(msg.attr_data(0), 1, &policy).is_ok());
    }

    #[test]
    fn test_iter_stops_on_garbage() {
        // length field shorter than the attribute header
        let data = [2u8, 0, 1, 0, 0, 0, 0, 0];
        assert_eq!(AttrIter::new(&data).count(), 0);

        // length field overruns the buffer
        let data = [200u8, 0, 1, 0, 0, 0, 0, 0];
        assert_eq!(AttrIter::new(&data).count(), 0);
    }

    #[test]
    fn test_find() {
        let mut msg = Message::new_simple(16, 0);
        msg.put_attr_u32(1, 10).unwrap();
        msg.put_attr_u32(7, 70).unwrap();

        assert_eq!(
            get::u32_ne(AttrIter::new(msg.attr_data(0)).find(7).unwrap()).unwrap(),
            70
        );
        assert!(AttrIter::new(msg.attr_data(0)).find(9).is_none());
    }
}
