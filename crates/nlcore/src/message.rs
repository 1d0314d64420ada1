//! Netlink message header, framing and the owned message object.

use std::io;
use std::mem;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::attr::{self, AttrIter, AttrPolicy, NlAttr, NLA_HDRLEN};
use crate::error::{Error, Result};
use crate::family::FamilyOps;
use crate::socket::{Credentials, Protocol, SocketAddr};

/// Netlink message header alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(mem::size_of::<NlMsgHdr>());

/// Length of a netlink message with the given payload, not including padding.
#[inline]
pub const fn nlmsg_msg_size(payload: usize) -> usize {
    NLMSG_HDRLEN + payload
}

/// Length of a netlink message with the given payload, including padding.
#[inline]
pub const fn nlmsg_total_size(payload: usize) -> usize {
    nlmsg_align(nlmsg_msg_size(payload))
}

/// Length of the padding at the tail of a message with the given payload.
#[inline]
pub const fn nlmsg_padlen(payload: usize) -> usize {
    nlmsg_total_size(payload) - nlmsg_msg_size(payload)
}

/// Port ID sentinel: filled in with the socket's bound port on completion.
pub const AUTO_PORT: u32 = 0;

/// Sequence sentinel: filled in with the socket's next sequence on completion.
pub const AUTO_SEQ: u32 = 0;

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a new message header.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nlmsg_len as usize).saturating_sub(NLMSG_HDRLEN)
    }

    /// Check if this is an error message.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NlMsgType::ERROR
    }

    /// Check if this is a done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NlMsgType::DONE
    }

    /// Check if this message has the multi flag.
    pub fn is_multi(&self) -> bool {
        self.nlmsg_flags & NLM_F_MULTI != 0
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse header from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Standard netlink control message types.
///
/// Types below [`NlMsgType::MIN_TYPE`] are reserved for control messages;
/// everything else is interpreted by the bound protocol family.
pub struct NlMsgType;

impl NlMsgType {
    /// No operation, message must be discarded.
    pub const NOOP: u16 = 1;
    /// Error message or ACK.
    pub const ERROR: u16 = 2;
    /// End of multipart message.
    pub const DONE: u16 = 3;
    /// Data lost, request resend.
    pub const OVERRUN: u16 = 4;
    /// Lowest family-specific message type.
    pub const MIN_TYPE: u16 = 0x10;
}

/// Netlink message flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ECHO: u16 = 0x08;
pub const NLM_F_DUMP_INTR: u16 = 0x10;

// Modifiers to GET request
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_ATOMIC: u16 = 0x400;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Modifiers to NEW request
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;

/// Symbolic name for a control message type, numeric otherwise.
pub fn msg_type_str(msg_type: u16) -> String {
    match msg_type {
        NlMsgType::NOOP => "NOOP".into(),
        NlMsgType::ERROR => "ERROR".into(),
        NlMsgType::DONE => "DONE".into(),
        NlMsgType::OVERRUN => "OVERRUN".into(),
        other => other.to_string(),
    }
}

/// Comma-separated symbolic rendition of header flags.
///
/// The GET modifiers win over the NEW modifiers for shared bit values,
/// unrecognised bits are appended in hex.
pub fn flags_str(flags: u16) -> String {
    const NAMES: [(u16, &str); 9] = [
        (NLM_F_REQUEST, "REQUEST"),
        (NLM_F_MULTI, "MULTI"),
        (NLM_F_ACK, "ACK"),
        (NLM_F_ECHO, "ECHO"),
        (NLM_F_DUMP_INTR, "DUMP_INTR"),
        (NLM_F_ROOT, "ROOT"),
        (NLM_F_MATCH, "MATCH"),
        (NLM_F_ATOMIC, "ATOMIC"),
        (NLM_F_APPEND, "APPEND"),
    ];

    let mut rem = flags;
    let mut out = String::new();
    for (bit, name) in NAMES {
        if rem & bit != 0 {
            rem &= !bit;
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(name);
        }
    }
    if rem != 0 {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(&format!("0x{rem:x}"));
    }
    out
}

/// Netlink error message payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Error code (negative errno or 0 for ACK).
    pub error: i32,
    /// Original message header that caused the error.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse an error body from a message payload.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: mem::size_of::<Self>(),
                actual: data.len(),
            })
    }

    /// Check if this is an ACK (no error).
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }
}

/// Iterator over netlink records in a receive buffer.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Create a new message iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<(&'a NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            return Some(Err(Error::InvalidMessage(format!(
                "invalid message length: {msg_len}"
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..msg_len];
        let aligned_len = nlmsg_align(msg_len);

        // Move to next record
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some(Ok((header, payload)))
    }
}

/// An owned netlink message.
///
/// The buffer holds one complete wire record, header first. The header's
/// `nlmsg_len` always covers the header, the payload and any trailing
/// padding added by [`reserve`](Message::reserve). Metadata carried next to
/// the buffer (bound protocol, peer addresses, credentials) never reaches
/// the wire through the buffer itself.
#[derive(Debug, Clone)]
pub struct Message {
    buf: Vec<u8>,
    protocol: Option<Protocol>,
    src: SocketAddr,
    dst: Option<SocketAddr>,
    creds: Option<Credentials>,
}

impl Message {
    /// Allocate an empty message: just a zeroed header, length stamped.
    pub fn new() -> Self {
        let mut msg = Self {
            buf: vec![0; NLMSG_HDRLEN],
            protocol: None,
            src: SocketAddr::default(),
            dst: None,
            creds: None,
        };
        msg.set_len(NLMSG_HDRLEN as u32);
        msg
    }

    /// Allocate a message with type and flags stamped into the header.
    pub fn new_simple(msg_type: u16, flags: u16) -> Self {
        let mut msg = Self::new();
        msg.set_type(msg_type);
        msg.set_flags(flags);
        msg
    }

    /// Allocate a message inheriting type, flags, sequence and port from a
    /// header template. The payload starts out empty.
    pub fn inherit(hdr: &NlMsgHdr) -> Self {
        let mut msg = Self::new();
        msg.set_type(hdr.nlmsg_type);
        msg.set_flags(hdr.nlmsg_flags);
        msg.set_seq(hdr.nlmsg_seq);
        msg.set_pid(hdr.nlmsg_pid);
        msg
    }

    /// Copy an on-wire record into a fresh owned message.
    ///
    /// The record length is taken from the embedded header.
    pub fn convert(record: &[u8]) -> Result<Self> {
        let hdr = NlMsgHdr::from_bytes(record)?;
        let len = hdr.nlmsg_len as usize;
        if len < NLMSG_HDRLEN || len > record.len() {
            return Err(Error::Truncated {
                expected: len,
                actual: record.len(),
            });
        }

        let mut buf = vec![0; nlmsg_align(len)];
        buf[..len].copy_from_slice(&record[..len]);

        Ok(Self {
            buf,
            protocol: None,
            src: SocketAddr::default(),
            dst: None,
            creds: None,
        })
    }

    /// Total buffer length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the message carries no payload.
    pub fn is_empty(&self) -> bool {
        self.header().payload_len() == 0
    }

    /// The raw wire image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// A copy of the message header.
    pub fn header(&self) -> NlMsgHdr {
        NlMsgHdr {
            nlmsg_len: u32::from_ne_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]),
            nlmsg_type: u16::from_ne_bytes([self.buf[4], self.buf[5]]),
            nlmsg_flags: u16::from_ne_bytes([self.buf[6], self.buf[7]]),
            nlmsg_seq: u32::from_ne_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]),
            nlmsg_pid: u32::from_ne_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]]),
        }
    }

    pub(crate) fn set_len(&mut self, len: u32) {
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
    }

    /// Set the message type.
    pub fn set_type(&mut self, msg_type: u16) {
        self.buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
    }

    /// Set the header flags.
    pub fn set_flags(&mut self, flags: u16) {
        self.buf[6..8].copy_from_slice(&flags.to_ne_bytes());
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Message payload: everything between the header and `nlmsg_len`.
    pub fn payload(&self) -> &[u8] {
        let end = (self.header().nlmsg_len as usize).min(self.buf.len());
        &self.buf[NLMSG_HDRLEN.min(end)..end]
    }

    /// Mutable view of the payload.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let end = (self.header().nlmsg_len as usize).min(self.buf.len());
        &mut self.buf[NLMSG_HDRLEN.min(end)..end]
    }

    /// Payload length in octets.
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }

    /// Attribute region: the payload past the aligned family header.
    pub fn attr_data(&self, hdrlen: usize) -> &[u8] {
        self.payload().get(nlmsg_align(hdrlen)..).unwrap_or(&[])
    }

    /// Length of the attribute region.
    pub fn attr_len(&self, hdrlen: usize) -> usize {
        self.attr_data(hdrlen).len()
    }

    /// Iterate the attributes following a family header of `hdrlen` octets.
    ///
    /// Fails when the declared message length cannot even hold the family
    /// header.
    pub fn attrs(&self, hdrlen: usize) -> Result<AttrIter<'_>> {
        let declared = self.header().nlmsg_len as usize;
        if declared < nlmsg_msg_size(hdrlen) {
            return Err(Error::Truncated {
                expected: nlmsg_msg_size(hdrlen),
                actual: declared,
            });
        }
        Ok(AttrIter::new(self.attr_data(hdrlen)))
    }

    /// Parse the attribute region into a type-indexed table, optionally
    /// validating against a policy. See [`attr::parse`].
    pub fn parse(
        &self,
        hdrlen: usize,
        maxtype: u16,
        policy: Option<&[AttrPolicy]>,
    ) -> Result<Vec<Option<&[u8]>>> {
        let declared = self.header().nlmsg_len as usize;
        if declared < nlmsg_msg_size(hdrlen) {
            return Err(Error::Truncated {
                expected: nlmsg_msg_size(hdrlen),
                actual: declared,
            });
        }
        attr::parse(self.attr_data(hdrlen), maxtype, policy)
    }

    /// Reserve room at the tail of the message.
    ///
    /// The reservation is rounded up to `pad` octets (`pad == 0` disables
    /// rounding), padding is zeroed and the header length grows accordingly.
    /// The returned slice covers exactly `len` octets of fresh tailroom; any
    /// previously obtained view into the buffer must be re-fetched after
    /// this call.
    pub fn reserve(&mut self, len: usize, pad: usize) -> &mut [u8] {
        let tlen = if pad > 0 {
            (len + pad - 1) & !(pad - 1)
        } else {
            len
        };

        let msg_len = self.header().nlmsg_len as usize;
        self.buf.truncate(msg_len);
        self.buf.resize(msg_len + tlen, 0);
        self.set_len((msg_len + tlen) as u32);

        &mut self.buf[msg_len..msg_len + len]
    }

    /// Append data to the tail of the message, padded to `pad` octets.
    pub fn append(&mut self, data: &[u8], pad: usize) {
        self.reserve(data.len(), pad).copy_from_slice(data);
    }

    /// Overwrite the header fields and, when `payload > 0`, reserve that
    /// much aligned payload room on top.
    pub fn put(&mut self, pid: u32, seq: u32, msg_type: u16, payload: usize, flags: u16) {
        self.set_type(msg_type);
        self.set_flags(flags);
        self.set_pid(pid);
        self.set_seq(seq);

        if payload > 0 {
            self.reserve(payload, NLMSG_ALIGNTO);
        }
    }

    /// The protocol this message is bound to, if any.
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Bind the message to a protocol.
    pub fn set_protocol(&mut self, protocol: Option<Protocol>) {
        self.protocol = protocol;
    }

    /// Source address of the message.
    pub fn src(&self) -> &SocketAddr {
        &self.src
    }

    /// Set the source address.
    pub fn set_src(&mut self, addr: SocketAddr) {
        self.src = addr;
    }

    /// Destination override, if one was set.
    pub fn dst(&self) -> Option<&SocketAddr> {
        self.dst.as_ref()
    }

    /// Override the destination address for this message.
    pub fn set_dst(&mut self, addr: SocketAddr) {
        self.dst = Some(addr);
    }

    /// Credentials attached to the message.
    pub fn creds(&self) -> Option<&Credentials> {
        self.creds.as_ref()
    }

    /// Attach credentials to the message.
    pub fn set_creds(&mut self, creds: Credentials) {
        self.creds = Some(creds);
    }

    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Dump the message in human-readable form, without family knowledge.
    ///
    /// Without a family lookup the payload is printed as a plain hex block;
    /// use [`dump_with`](Message::dump_with) to locate and walk the
    /// attribute tree.
    pub fn dump<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        self.dump_with(w, None)
    }

    /// Dump the message, using `family` to resolve message names and the
    /// family header size that locates the attribute region.
    pub fn dump_with<W: io::Write>(
        &self,
        w: &mut W,
        family: Option<&dyn FamilyOps>,
    ) -> io::Result<()> {
        let hdr = self.header();

        writeln!(
            w,
            "--------------------------   BEGIN NETLINK MESSAGE \
             ---------------------------"
        )?;
        writeln!(w, "  [HEADER] {NLMSG_HDRLEN} octets")?;
        self.print_hdr(w, &hdr, family)?;

        if hdr.is_error() && hdr.nlmsg_len as usize >= nlmsg_msg_size(mem::size_of::<NlMsgError>())
        {
            if let Ok(e) = NlMsgError::from_bytes(self.payload()) {
                writeln!(w, "  [ERRORMSG] {} octets", mem::size_of::<NlMsgError>())?;
                writeln!(
                    w,
                    "    .error = {} \"{}\"",
                    e.error,
                    io::Error::from_raw_os_error(-e.error)
                )?;
                writeln!(w, "  [ORIGINAL MESSAGE] {NLMSG_HDRLEN} octets")?;
                self.print_hdr(w, &e.msg, family)?;
            }
        } else if self.payload_len() > 0 {
            let hdrsize = family.and_then(|f| {
                self.protocol
                    .and_then(|p| f.header_size(p, hdr.nlmsg_type))
            });

            match hdrsize {
                Some(hl) => {
                    let attrs = self.attr_data(hl);
                    let family_len = self.payload_len() - attrs.len();
                    writeln!(w, "  [PAYLOAD] {family_len} octets")?;
                    dump_hex(w, &self.payload()[..family_len], 0)?;
                    dump_attrs(w, attrs, 0)?;
                }
                None => {
                    writeln!(w, "  [PAYLOAD] {} octets", self.payload_len())?;
                    dump_hex(w, self.payload(), 0)?;
                }
            }
        }

        writeln!(
            w,
            "---------------------------  END NETLINK MESSAGE   \
             ---------------------------"
        )
    }

    fn print_hdr<W: io::Write>(
        &self,
        w: &mut W,
        hdr: &NlMsgHdr,
        family: Option<&dyn FamilyOps>,
    ) -> io::Result<()> {
        let name = family
            .and_then(|f| {
                self.protocol
                    .and_then(|p| f.message_name(p, hdr.nlmsg_type))
            })
            .unwrap_or_else(|| msg_type_str(hdr.nlmsg_type));

        writeln!(w, "    .nlmsg_len = {}", hdr.nlmsg_len)?;
        writeln!(w, "    .nlmsg_type = {} <{}>", hdr.nlmsg_type, name)?;
        writeln!(
            w,
            "    .nlmsg_flags = {} <{}>",
            hdr.nlmsg_flags,
            flags_str(hdr.nlmsg_flags)
        )?;
        writeln!(w, "    .nlmsg_seq = {}", hdr.nlmsg_seq)?;
        writeln!(w, "    .nlmsg_pid = {}", hdr.nlmsg_pid)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

fn prefix_line<W: io::Write>(w: &mut W, prefix: usize) -> io::Result<()> {
    for _ in 0..prefix {
        write!(w, "  ")?;
    }
    Ok(())
}

fn dump_hex<W: io::Write>(w: &mut W, data: &[u8], prefix: usize) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let limit = 18usize.saturating_sub(prefix * 2).max(1);
    for chunk in data.chunks(limit) {
        prefix_line(w, prefix)?;
        write!(w, "    ")?;
        for b in chunk {
            write!(w, "{b:02x} ")?;
        }
        for _ in chunk.len()..limit {
            write!(w, "   ")?;
        }
        let ascii: String = chunk
            .iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        writeln!(w, "{ascii}")?;
    }
    Ok(())
}

fn dump_attrs<W: io::Write>(w: &mut W, mut data: &[u8], prefix: usize) -> io::Result<()> {
    while data.len() >= NLA_HDRLEN {
        let attr = match NlAttr::from_bytes(data) {
            Ok(a) => a,
            Err(_) => break,
        };
        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > data.len() {
            break;
        }

        let alen = len - NLA_HDRLEN;
        prefix_line(w, prefix)?;
        writeln!(
            w,
            "  [ATTR {:02}{}] {} octets",
            attr.kind(),
            if attr.is_nested() { " NESTED" } else { "" },
            alen
        )?;

        let payload = &data[NLA_HDRLEN..len];
        if attr.is_nested() {
            dump_attrs(w, payload, prefix + 1)?;
        } else {
            dump_hex(w, payload, prefix)?;
        }

        let padlen = (attr::nla_align(len) - len).min(data.len() - len);
        if padlen > 0 {
            prefix_line(w, prefix)?;
            writeln!(w, "  [PADDING] {padlen} octets")?;
            dump_hex(w, &data[len..len + padlen], prefix)?;
        }

        data = &data[(len + padlen).min(data.len())..];
    }

    if !data.is_empty() {
        prefix_line(w, prefix)?;
        writeln!(w, "  [LEFTOVER] {} octets", data.len())?;
    }
    Ok(())
}
