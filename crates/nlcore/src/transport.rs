//! Transport engine: outbound completion and send paths, raw datagram
//! receive, and the inbound dispatch loop.

use std::io::{self, IoSlice};
use std::mem;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::handlers::{Action, Callbacks, Event};
use crate::message::{
    nlmsg_align, nlmsg_msg_size, Message, NlMsgError, NlMsgHdr, NlMsgType, AUTO_PORT, AUTO_SEQ,
    NLMSG_ALIGNTO, NLMSG_HDRLEN, NLM_F_ACK, NLM_F_DUMP_INTR, NLM_F_MULTI, NLM_F_REQUEST,
};
use crate::socket::{Credentials, NetlinkSocket, SocketAddr};

/// One datagram's worth of bytes as handed out by [`NetlinkSocket::recv`].
///
/// A single datagram may carry several concatenated on-wire records.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// The received record stream.
    pub buf: Vec<u8>,
    /// Address of the sending peer.
    pub src: SocketAddr,
    /// Sender credentials, when credential passing is enabled.
    pub creds: Option<Credentials>,
}

enum Verdict {
    /// Advance to the next record.
    Next,
    /// Terminate the dispatch loop cleanly.
    Stop,
}

impl NetlinkSocket {
    /// Finalize a message for transmission.
    ///
    /// Fills the `AUTO_PORT`/`AUTO_SEQ` sentinels from the socket (drawing
    /// and consuming the next send sequence), binds the message to the
    /// socket's protocol when unbound, and sets REQUEST plus — unless
    /// auto-ack is disabled — ACK. Fields that are already resolved are
    /// left untouched; completing a message that still carries sentinels
    /// draws a fresh sequence each time.
    pub fn complete_msg(&mut self, msg: &mut Message) {
        let hdr = msg.header();

        if hdr.nlmsg_pid == AUTO_PORT {
            msg.set_pid(self.local.port());
        }
        if hdr.nlmsg_seq == AUTO_SEQ {
            let seq = self.use_seq();
            msg.set_seq(seq);
        }
        if msg.protocol().is_none() {
            msg.set_protocol(self.protocol);
        }

        let mut flags = hdr.nlmsg_flags | NLM_F_REQUEST;
        if !self.no_auto_ack {
            flags |= NLM_F_ACK;
        }
        msg.set_flags(flags);
    }

    /// Send raw bytes as one datagram to the socket's peer.
    pub fn sendto(&self, buf: &[u8]) -> Result<usize> {
        let peer = self.peer.to_raw();

        // SAFETY: buf and peer are live for the duration of the call.
        let n = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &peer as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        trace!(bytes = n, "sent raw datagram");
        Ok(n as usize)
    }

    /// Send a message followed by extra payload segments as one datagram.
    ///
    /// The message's source address is stamped from the socket's bound
    /// address and the MSG_OUT hook gets the last look at it: a non-Proceed
    /// return short-circuits with `Ok(0)` and nothing is written. The
    /// destination defaults to the socket's peer, a per-message override
    /// wins. Credentials attached to the message travel as SCM_CREDENTIALS
    /// ancillary data.
    pub fn send_vectored(&self, msg: &mut Message, extra: &[IoSlice<'_>]) -> Result<usize> {
        let len = msg.header().nlmsg_len as usize;
        if len > msg.len() {
            return Err(Error::Truncated {
                expected: len,
                actual: msg.len(),
            });
        }

        msg.set_src(self.local);

        if let Some(result) = self.cb.call(Event::MsgOut, msg) {
            match result? {
                Action::Proceed => {}
                Action::Skip | Action::Stop => return Ok(0),
            }
        }

        let dst = msg.dst().copied().unwrap_or(self.peer);
        let mut raw_dst = dst.to_raw();

        let mut iov: Vec<libc::iovec> = Vec::with_capacity(1 + extra.len());
        iov.push(libc::iovec {
            iov_base: msg.as_bytes().as_ptr() as *mut libc::c_void,
            iov_len: len,
        });
        for seg in extra {
            iov.push(libc::iovec {
                iov_base: seg.as_ptr() as *mut libc::c_void,
                iov_len: seg.len(),
            });
        }

        // SAFETY: a zeroed msghdr is valid before the pointer fields are set.
        let mut mh: libc::msghdr = unsafe { mem::zeroed() };
        mh.msg_name = &mut raw_dst as *mut libc::sockaddr_nl as *mut libc::c_void;
        mh.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        mh.msg_iov = iov.as_mut_ptr();
        mh.msg_iovlen = iov.len() as _;

        let mut control: Vec<u8> = Vec::new();
        if let Some(creds) = msg.creds() {
            let ucred = creds.to_ucred();
            // SAFETY: CMSG_SPACE is a pure size computation.
            let space =
                unsafe { libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32) } as usize;
            control.resize(space, 0);
            mh.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            mh.msg_controllen = control.len() as _;

            // SAFETY: the control buffer was sized with CMSG_SPACE above and
            // is owned by this frame.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&mh);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_CREDENTIALS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::ucred>() as u32) as _;
                std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut libc::ucred, ucred);
            }
        }

        // SAFETY: mh points at live name/iov/control buffers.
        let n = unsafe { libc::sendmsg(self.fd, &mh, 0) };
        if n < 0 {
            return Err(io::Error::last_os_error().into());
        }
        trace!(bytes = n, "sent netlink message");
        Ok(n as usize)
    }

    /// Send a message as a single-segment datagram.
    pub fn send(&self, msg: &mut Message) -> Result<usize> {
        self.send_vectored(msg, &[])
    }

    /// Complete and send a message, honouring a send override if installed.
    pub fn send_auto(&mut self, msg: &mut Message) -> Result<usize> {
        self.complete_msg(msg);

        match self.cb.send_override().cloned() {
            Some(hook) => (*hook)(self, msg),
            None => self.send(msg),
        }
    }

    /// Complete and send a message, then block until it is acknowledged.
    ///
    /// With auto-ack disabled no acknowledgement was requested, so this
    /// returns right after sending and any eventual error record is the
    /// caller's to collect.
    pub fn send_sync(&mut self, mut msg: Message) -> Result<()> {
        self.send_auto(&mut msg)?;
        drop(msg);

        if self.no_auto_ack {
            return Ok(());
        }
        self.wait_for_ack()
    }

    /// Build a message of `msg_type`/`flags` around a payload and send it.
    pub fn send_simple(&mut self, msg_type: u16, flags: u16, payload: &[u8]) -> Result<usize> {
        let mut msg = Message::new_simple(msg_type, flags);
        if !payload.is_empty() {
            msg.append(payload, NLMSG_ALIGNTO);
        }
        self.send_auto(&mut msg)
    }

    /// Receive one datagram.
    ///
    /// The receive buffer starts at the configured socket buffer size, or
    /// the system page size when none is set. With the peek flag enabled
    /// the exact datagram size is probed first. Interrupted reads are
    /// retried, truncated control data doubles the ancillary buffer, and a
    /// truncated payload grows the buffer to the announced size before the
    /// read is redone.
    ///
    /// Returns `Ok(None)` on EOF and on a non-blocking socket with no data.
    pub fn recv(&self) -> Result<Option<Datagram>> {
        // SAFETY: sysconf(2) has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
        let mut buf = vec![0u8; if self.bufsize > 0 { self.bufsize } else { page_size }];
        let mut peek = self.peek;

        let cred_space =
            // SAFETY: CMSG_SPACE is a pure size computation.
            unsafe { libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32) } as usize;
        let mut control: Vec<u8> = if self.passcred {
            vec![0; cred_space]
        } else {
            Vec::new()
        };

        loop {
            // SAFETY: zeroed sockaddr_nl is a valid receive target.
            let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                iov_len: buf.len(),
            };

            // SAFETY: a zeroed msghdr is valid before the pointer fields are
            // set.
            let mut mh: libc::msghdr = unsafe { mem::zeroed() };
            mh.msg_name = &mut addr as *mut libc::sockaddr_nl as *mut libc::c_void;
            mh.msg_namelen = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
            mh.msg_iov = &mut iov;
            mh.msg_iovlen = 1;
            if !control.is_empty() {
                mh.msg_control = control.as_mut_ptr() as *mut libc::c_void;
                mh.msg_controllen = control.len() as _;
            }

            let flags = if peek {
                libc::MSG_PEEK | libc::MSG_TRUNC
            } else {
                0
            };

            // SAFETY: mh points at live buffers owned by this frame.
            let n = unsafe { libc::recvmsg(self.fd, &mut mh, flags) };

            if n == 0 {
                return Ok(None);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => {
                        debug!("recvmsg interrupted, retrying");
                        continue;
                    }
                    Some(libc::EAGAIN) => return Ok(None),
                    _ => return Err(err.into()),
                }
            }
            let n = n as usize;

            if mh.msg_flags & libc::MSG_CTRUNC != 0 {
                // Ancillary data did not fit.
                if control.is_empty() {
                    control = vec![0; cred_space];
                } else {
                    control.resize(control.len() * 2, 0);
                }
                continue;
            }

            if buf.len() < n || mh.msg_flags & libc::MSG_TRUNC != 0 {
                // The buffer is too small; n announces the real datagram
                // size, grow and redo the read.
                buf.resize(n, 0);
                peek = false;
                continue;
            }

            if peek {
                // The probe fit, now do the actual read.
                peek = false;
                continue;
            }

            if mh.msg_namelen as usize != mem::size_of::<libc::sockaddr_nl>() {
                return Err(Error::NoAddress);
            }

            let creds = if self.passcred { parse_creds(&mh) } else { None };

            buf.truncate(n);
            trace!(bytes = n, "received datagram");
            return Ok(Some(Datagram {
                buf,
                src: SocketAddr::from_raw(&addr),
                creds,
            }));
        }
    }

    /// Receive and dispatch records, reporting how many family records were
    /// delivered.
    ///
    /// Runs the dispatch loop described in the module docs against `cb`,
    /// continuing across datagrams while a multipart stream is open. An
    /// installed receive-loop override replaces the whole procedure.
    pub fn recvmsgs_report(&mut self, cb: &Callbacks) -> Result<usize> {
        if let Some(hook) = cb.recvmsgs_override() {
            let hook = hook.clone();
            return (*hook)(self, cb);
        }

        let mut interrupted = false;
        let result = self.dispatch(cb, &mut interrupted);

        // An unhandled dump interrupt wins over everything else: the stream
        // was drained through DONE, but the data cannot be trusted.
        if interrupted {
            return Err(Error::DumpInterrupted);
        }
        result
    }

    /// Receive and dispatch records, discarding the record count.
    pub fn recvmsgs(&mut self, cb: &Callbacks) -> Result<()> {
        self.recvmsgs_report(cb).map(|_| ())
    }

    /// Receive and dispatch records using the socket's own callback set.
    pub fn recvmsgs_default(&mut self) -> Result<()> {
        let cb = Arc::clone(&self.cb);
        self.recvmsgs(&cb)
    }

    /// Wait until the latest unacknowledged request is acknowledged.
    pub fn wait_for_ack(&mut self) -> Result<()> {
        let mut cb = Callbacks::clone(&self.cb);
        cb.set(Event::Ack, |_msg| Ok(Action::Stop));
        self.recvmsgs(&cb)
    }

    /// Pick up a single reply object from the response stream.
    ///
    /// Runs the dispatch loop with a VALID hook that feeds each family
    /// record through `parser` and keeps the last result.
    pub fn pickup<T, F>(&mut self, parser: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Message) -> Result<T> + Send + Sync + 'static,
    {
        let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

        let mut cb = Callbacks::clone(&self.cb);
        let store = Arc::clone(&slot);
        cb.set(Event::Valid, move |msg| {
            *store.lock().unwrap() = Some(parser(msg)?);
            Ok(Action::Proceed)
        });

        self.recvmsgs(&cb)?;

        let mut slot = slot.lock().unwrap();
        slot.take().ok_or(Error::NoAnswer)
    }

    fn dispatch(&mut self, cb: &Callbacks, interrupted: &mut bool) -> Result<usize> {
        let mut nrecv = 0usize;
        let mut multipart = false;

        loop {
            let dgram = match cb.recv_override() {
                Some(hook) => (**hook)(self)?,
                None => self.recv()?,
            };
            let Some(dgram) = dgram else {
                // EOF or would-block: hand the condition back verbatim.
                return Ok(0);
            };
            trace!(bytes = dgram.buf.len(), "processing record stream");

            let data = &dgram.buf;
            let mut pos = 0;
            while data.len() - pos >= NLMSG_HDRLEN {
                let hdr = match NlMsgHdr::from_bytes(&data[pos..]) {
                    Ok(h) => *h,
                    Err(_) => break,
                };
                let len = hdr.nlmsg_len as usize;
                if len < NLMSG_HDRLEN || len > data.len() - pos {
                    break;
                }

                let mut msg = Message::convert(&data[pos..pos + len])?;
                msg.set_protocol(self.protocol);
                msg.set_src(dgram.src);
                if let Some(creds) = dgram.creds {
                    msg.set_creds(creds);
                }

                let verdict = self.process_record(
                    cb,
                    &msg,
                    &hdr,
                    &mut nrecv,
                    &mut multipart,
                    interrupted,
                )?;
                match verdict {
                    Verdict::Next => {}
                    Verdict::Stop => return Ok(nrecv),
                }

                pos += nlmsg_align(len);
                if pos >= data.len() {
                    break;
                }
            }

            if !multipart {
                return Ok(nrecv);
            }
            // Multipart stream still open, fetch the next datagram.
        }
    }

    fn process_record(
        &mut self,
        cb: &Callbacks,
        msg: &Message,
        hdr: &NlMsgHdr,
        nrecv: &mut usize,
        multipart: &mut bool,
        interrupted: &mut bool,
    ) -> Result<Verdict> {
        // Dispatch one hook slot; evaluates to whether a hook was installed.
        macro_rules! invoke {
            ($event:expr) => {
                match cb.call($event, msg) {
                    Some(result) => match result? {
                        Action::Proceed => true,
                        Action::Skip => return Ok(Verdict::Next),
                        Action::Stop => return Ok(Verdict::Stop),
                    },
                    None => false,
                }
            };
        }

        // The raw hook sees every record before any verification.
        invoke!(Event::MsgIn);

        // Sequence checking: an installed hook replaces the built-in strict
        // ordering, which itself only applies in auto-ack mode.
        if cb.handler(Event::SeqCheck).is_some() {
            invoke!(Event::SeqCheck);
        } else if !self.no_auto_ack && hdr.nlmsg_seq != self.seq_expect {
            if !invoke!(Event::Invalid) {
                return Err(Error::SequenceMismatch {
                    expected: self.seq_expect,
                    actual: hdr.nlmsg_seq,
                });
            }
        }

        if hdr.nlmsg_type == NlMsgType::DONE
            || hdr.nlmsg_type == NlMsgType::ERROR
            || hdr.nlmsg_type == NlMsgType::NOOP
            || hdr.nlmsg_type == NlMsgType::OVERRUN
        {
            // One sequence per control-or-multipart unit regardless of the
            // MULTI flag; some senders get this wrong.
            self.seq_expect = self.seq_expect.wrapping_add(1);
            trace!(seq = self.seq_expect, "advanced expected sequence");
        }

        if hdr.nlmsg_flags & NLM_F_MULTI != 0 {
            *multipart = true;
        }

        if hdr.nlmsg_flags & NLM_F_DUMP_INTR != 0 {
            if cb.handler(Event::DumpIntr).is_some() {
                invoke!(Event::DumpIntr);
            } else {
                // Latch the inconsistency and keep reading until DONE so the
                // buffered stream is fully drained.
                *interrupted = true;
            }
        }

        if hdr.nlmsg_flags & NLM_F_ACK != 0 {
            // Peer asked for an acknowledgement; the default sends none.
            invoke!(Event::SendAck);
        }

        if hdr.nlmsg_type == NlMsgType::DONE {
            *multipart = false;
            invoke!(Event::Finish);
        } else if hdr.nlmsg_type == NlMsgType::NOOP {
            if !invoke!(Event::Skipped) {
                return Ok(Verdict::Next);
            }
        } else if hdr.nlmsg_type == NlMsgType::OVERRUN {
            if !invoke!(Event::Overrun) {
                return Err(Error::Overflow);
            }
        } else if hdr.nlmsg_type == NlMsgType::ERROR {
            if (hdr.nlmsg_len as usize) < nlmsg_msg_size(mem::size_of::<NlMsgError>()) {
                // Truncated error record.
                if !invoke!(Event::Invalid) {
                    return Err(Error::Truncated {
                        expected: nlmsg_msg_size(mem::size_of::<NlMsgError>()),
                        actual: hdr.nlmsg_len as usize,
                    });
                }
            } else {
                let body = *NlMsgError::from_bytes(msg.payload())?;
                if !body.is_ack() {
                    // Error reported back from the peer; the error hook picks
                    // between abort, skip and surface.
                    match cb.call_err(msg.src(), &body) {
                        Some(result) => match result? {
                            Action::Skip => return Ok(Verdict::Next),
                            Action::Stop => return Err(Error::from_errno(body.error)),
                            Action::Proceed => {}
                        },
                        None => return Err(Error::from_errno(body.error)),
                    }
                } else {
                    invoke!(Event::Ack);
                }
            }
        } else {
            *nrecv += 1;
            invoke!(Event::Valid);
        }

        Ok(Verdict::Next)
    }
}

fn parse_creds(mh: &libc::msghdr) -> Option<Credentials> {
    // SAFETY: the control buffer referenced by mh outlives this walk and was
    // filled in by the kernel.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(mh);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS
            {
                let ucred = std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::ucred);
                return Some(Credentials::from_ucred(&ucred));
            }
            cmsg = libc::CMSG_NXTHDR(mh, cmsg);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Protocol;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAMILY_TYPE: u16 = 16;

    fn test_socket() -> NetlinkSocket {
        let mut sk = NetlinkSocket::new();
        sk.protocol = Some(Protocol::Route);
        sk.local = SocketAddr::new(100, 0);
        sk.seq_next = 42;
        sk.seq_expect = 42;
        sk
    }

    fn record(msg_type: u16, flags: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut msg = Message::new_simple(msg_type, flags);
        msg.set_seq(seq);
        msg.set_pid(100);
        if !payload.is_empty() {
            msg.append(payload, NLMSG_ALIGNTO);
        }
        msg.as_bytes().to_vec()
    }

    fn error_record(error: i32, seq: u32) -> Vec<u8> {
        let mut orig = NlMsgHdr::new(FAMILY_TYPE, NLM_F_REQUEST | NLM_F_ACK);
        orig.nlmsg_seq = seq;

        let mut payload = error.to_ne_bytes().to_vec();
        payload.extend_from_slice(orig.as_bytes());
        record(NlMsgType::ERROR, 0, seq, &payload)
    }

    fn datagram(buf: Vec<u8>) -> Datagram {
        Datagram {
            buf,
            src: SocketAddr::new(0, 0),
            creds: None,
        }
    }

    fn feed(cb: &mut Callbacks, datagrams: Vec<Datagram>) {
        let queue = Mutex::new(VecDeque::from(datagrams));
        cb.overwrite_recv(move |_sk| Ok(queue.lock().unwrap().pop_front()));
    }

    fn counter(cb: &mut Callbacks, event: Event) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        cb.set(event, move |_msg| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(Action::Proceed)
        });
        count
    }

    #[test]
    fn test_complete_fills_auto_fields() {
        let mut sk = test_socket();
        let mut msg = Message::new_simple(FAMILY_TYPE, 0);
        sk.complete_msg(&mut msg);

        let hdr = msg.header();
        assert_eq!(hdr.nlmsg_pid, 100);
        assert_eq!(hdr.nlmsg_seq, 42);
        assert_eq!(hdr.nlmsg_flags, NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(msg.protocol(), Some(Protocol::Route));

        // completing a second sentinel-carrying message draws the next
        // sequence in order
        let mut next = Message::new_simple(FAMILY_TYPE, 0);
        sk.complete_msg(&mut next);
        assert_eq!(next.header().nlmsg_seq, 43);
    }

    #[test]
    fn test_complete_leaves_resolved_fields() {
        let mut sk = test_socket();
        let mut msg = Message::new_simple(FAMILY_TYPE, 0);
        msg.set_seq(7);
        msg.set_pid(9);
        sk.complete_msg(&mut msg);

        let hdr = msg.header();
        assert_eq!(hdr.nlmsg_seq, 7);
        assert_eq!(hdr.nlmsg_pid, 9);
        assert_eq!(sk.seq_next, 42, "no sequence was drawn");

        // re-completing the now-resolved message is a no-op on those fields
        sk.complete_msg(&mut msg);
        assert_eq!(msg.header().nlmsg_seq, 7);
    }

    #[test]
    fn test_complete_without_auto_ack() {
        let mut sk = test_socket();
        sk.disable_auto_ack();

        let mut msg = Message::new_simple(FAMILY_TYPE, 0);
        sk.complete_msg(&mut msg);
        assert_eq!(msg.header().nlmsg_flags, NLM_F_REQUEST);
    }

    #[test]
    fn test_send_rejects_overlong_declared_length() {
        let sk = test_socket();
        let mut msg = Message::new_simple(FAMILY_TYPE, 0);
        msg.set_len(64);

        assert!(matches!(
            sk.send(&mut msg),
            Err(Error::Truncated {
                expected: 64,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_msg_out_hook_gates_send() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        cb.set(Event::MsgOut, |_| Ok(Action::Stop));
        sk.set_callbacks(Arc::new(cb));

        let mut msg = Message::new_simple(FAMILY_TYPE, 0);
        assert_eq!(sk.send(&mut msg).unwrap(), 0);
        // the source address was stamped before the hook ran
        assert_eq!(msg.src().port(), 100);
    }

    #[test]
    fn test_send_override_is_used() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        cb.overwrite_send(|_sk, msg| Ok(msg.len()));
        sk.set_callbacks(Arc::new(cb));

        let mut msg = Message::new_simple(FAMILY_TYPE, 0);
        assert_eq!(sk.send_auto(&mut msg).unwrap(), NLMSG_HDRLEN);
        // completion still ran
        assert_eq!(msg.header().nlmsg_seq, 42);
    }

    #[test]
    fn test_empty_request_ack() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(0, 42))]);
        let msg_in = counter(&mut cb, Event::MsgIn);
        let ack = counter(&mut cb, Event::Ack);

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);
        assert_eq!(msg_in.load(Ordering::SeqCst), 1);
        assert_eq!(ack.load(Ordering::SeqCst), 1);
        assert_eq!(sk.seq_expect, 43);
    }

    #[test]
    fn test_multipart_dump() {
        let mut sk = test_socket();

        let mut first = record(FAMILY_TYPE, NLM_F_MULTI, 42, &[1, 0, 0, 0]);
        first.extend(record(FAMILY_TYPE, NLM_F_MULTI, 42, &[2, 0, 0, 0]));
        let mut second = record(FAMILY_TYPE, NLM_F_MULTI, 42, &[3, 0, 0, 0]);
        second.extend(record(NlMsgType::DONE, NLM_F_MULTI, 42, &[]));

        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(first), datagram(second)]);
        let finish = counter(&mut cb, Event::Finish);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let order = Arc::clone(&seen);
        cb.set(Event::Valid, move |msg| {
            order.lock().unwrap().push(msg.payload()[0]);
            Ok(Action::Proceed)
        });

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(finish.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_response_translates() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(-17, 42))]);
        let valid = counter(&mut cb, Event::Valid);

        let err = sk.recvmsgs(&cb).unwrap_err();
        assert_eq!(err.errno(), Some(17));
        assert_eq!(valid.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_hook_dispositions() {
        // Skip swallows the error record
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(-1, 42))]);
        cb.set_err(|_who, _e| Ok(Action::Skip));
        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);

        // Stop surfaces the translated code
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(-1, 42))]);
        cb.set_err(|_who, _e| Ok(Action::Stop));
        assert_eq!(sk.recvmsgs(&cb).unwrap_err().errno(), Some(1));

        // an Err return aborts with exactly that error
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(-1, 42))]);
        cb.set_err(|_who, _e| Err(Error::NoAnswer));
        assert!(matches!(sk.recvmsgs(&cb), Err(Error::NoAnswer)));
    }

    #[test]
    fn test_sequence_mismatch() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(record(FAMILY_TYPE, 0, 43, &[0; 4]))]);
        let valid = counter(&mut cb, Event::Valid);

        assert!(matches!(
            sk.recvmsgs(&cb),
            Err(Error::SequenceMismatch {
                expected: 42,
                actual: 43
            })
        ));
        assert_eq!(valid.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_hook_can_skip_mismatch() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(record(FAMILY_TYPE, 0, 43, &[0; 4]))]);
        cb.set(Event::Invalid, |_| Ok(Action::Skip));
        let valid = counter(&mut cb, Event::Valid);

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);
        assert_eq!(valid.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_seq_check_hook_replaces_builtin() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(record(FAMILY_TYPE, 0, 999, &[0; 4]))]);
        cb.set(Event::SeqCheck, |_| Ok(Action::Proceed));
        let valid = counter(&mut cb, Event::Valid);

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 1);
        assert_eq!(valid.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_auto_ack_disables_seq_check() {
        let mut sk = test_socket();
        sk.disable_auto_ack();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(record(FAMILY_TYPE, 0, 999, &[0; 4]))]);

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 1);
    }

    #[test]
    fn test_dump_interrupted_is_latched() {
        let mut sk = test_socket();

        let mut buf = record(FAMILY_TYPE, NLM_F_MULTI | NLM_F_DUMP_INTR, 42, &[0; 4]);
        buf.extend(record(NlMsgType::DONE, NLM_F_MULTI, 42, &[]));

        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(buf)]);
        let valid = counter(&mut cb, Event::Valid);
        let finish = counter(&mut cb, Event::Finish);

        assert!(matches!(sk.recvmsgs(&cb), Err(Error::DumpInterrupted)));
        // the stream was still drained through DONE
        assert_eq!(valid.load(Ordering::SeqCst), 1);
        assert_eq!(finish.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dump_intr_hook_suppresses_latch() {
        let mut sk = test_socket();

        let mut buf = record(FAMILY_TYPE, NLM_F_MULTI | NLM_F_DUMP_INTR, 42, &[0; 4]);
        buf.extend(record(NlMsgType::DONE, NLM_F_MULTI, 42, &[]));

        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(buf)]);
        cb.set(Event::DumpIntr, |_| Ok(Action::Proceed));

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 1);
    }

    #[test]
    fn test_credentials_round_trip() {
        let mut sk = test_socket();
        let creds = Credentials {
            pid: 100,
            uid: 0,
            gid: 0,
        };

        let mut cb = Callbacks::default();
        feed(
            &mut cb,
            vec![Datagram {
                buf: record(FAMILY_TYPE, 0, 42, &[0; 4]),
                src: SocketAddr::new(0, 0),
                creds: Some(creds),
            }],
        );

        let delivered = Arc::new(Mutex::new(None));
        let out = Arc::clone(&delivered);
        cb.set(Event::Valid, move |msg| {
            *out.lock().unwrap() = msg.creds().copied();
            Ok(Action::Proceed)
        });

        sk.recvmsgs(&cb).unwrap();
        assert_eq!(delivered.lock().unwrap().unwrap(), creds);
    }

    #[test]
    fn test_noop_is_skipped_by_default() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(record(NlMsgType::NOOP, 0, 42, &[]))]);
        let valid = counter(&mut cb, Event::Valid);

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);
        assert_eq!(valid.load(Ordering::SeqCst), 0);
        assert_eq!(sk.seq_expect, 43);
    }

    #[test]
    fn test_overrun_aborts_by_default() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(
            &mut cb,
            vec![datagram(record(NlMsgType::OVERRUN, 0, 42, &[]))],
        );

        assert!(matches!(sk.recvmsgs(&cb), Err(Error::Overflow)));
    }

    #[test]
    fn test_truncated_error_record() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        // error body cut short: code only, no embedded header
        feed(
            &mut cb,
            vec![datagram(record(NlMsgType::ERROR, 0, 42, &[0; 4]))],
        );

        assert!(matches!(sk.recvmsgs(&cb), Err(Error::Truncated { .. })));
    }

    #[test]
    fn test_stop_ends_invocation_next_call_resumes() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(
            &mut cb,
            vec![
                datagram(record(FAMILY_TYPE, 0, 42, &[1, 0, 0, 0])),
                datagram(record(FAMILY_TYPE, 0, 42, &[2, 0, 0, 0])),
            ],
        );
        cb.set(Event::Valid, |_| Ok(Action::Stop));

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 1);
        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 1);
        // queue drained: the next invocation reports no data
        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);
    }

    #[test]
    fn test_msg_in_skip_bypasses_processing() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(-17, 42))]);
        cb.set(Event::MsgIn, |_| Ok(Action::Skip));

        // the error record is never classified, so nothing aborts
        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);
        // and the sequence bump was skipped along with the rest
        assert_eq!(sk.seq_expect, 42);
    }

    #[test]
    fn test_dispatch_over_concatenation_equals_sequence() {
        let single = |payload: u8| record(FAMILY_TYPE, 0, 42, &[payload, 0, 0, 0]);

        // one datagram carrying both records
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        let mut concat = single(1);
        concat.extend(single(2));
        feed(&mut cb, vec![datagram(concat)]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        cb.set(Event::Valid, move |msg| {
            out.lock().unwrap().push(msg.payload()[0]);
            Ok(Action::Proceed)
        });
        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 2);

        // two datagrams dispatched in sequence
        let mut sk2 = test_socket();
        let mut cb2 = Callbacks::default();
        feed(&mut cb2, vec![datagram(single(1)), datagram(single(2))]);
        let seen2 = Arc::new(Mutex::new(Vec::new()));
        let out2 = Arc::clone(&seen2);
        cb2.set(Event::Valid, move |msg| {
            out2.lock().unwrap().push(msg.payload()[0]);
            Ok(Action::Proceed)
        });
        assert_eq!(sk2.recvmsgs_report(&cb2).unwrap(), 1);
        assert_eq!(sk2.recvmsgs_report(&cb2).unwrap(), 1);

        assert_eq!(*seen.lock().unwrap(), *seen2.lock().unwrap());
    }

    #[test]
    fn test_no_data_returns_zero_verbatim() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![]);

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 0);
        sk.recvmsgs(&cb).unwrap();
    }

    #[test]
    fn test_recvmsgs_override_replaces_loop() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        cb.overwrite_recvmsgs(|_sk, _cb| Ok(7));

        assert_eq!(sk.recvmsgs_report(&cb).unwrap(), 7);
    }

    #[test]
    fn test_wait_for_ack() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(0, 42))]);
        sk.set_callbacks(Arc::new(cb));

        sk.wait_for_ack().unwrap();
        assert_eq!(sk.seq_expect, 43);
    }

    #[test]
    fn test_wait_for_ack_surfaces_error() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(error_record(-13, 42))]);
        sk.set_callbacks(Arc::new(cb));

        assert_eq!(sk.wait_for_ack().unwrap_err().errno(), Some(13));
    }

    #[test]
    fn test_pickup_returns_parsed_object() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(
            &mut cb,
            vec![datagram(record(FAMILY_TYPE, 0, 42, &7u32.to_ne_bytes()))],
        );
        sk.set_callbacks(Arc::new(cb));

        let value = sk
            .pickup(|msg| crate::attr::get::u32_ne(msg.payload()))
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_pickup_without_answer() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(&mut cb, vec![datagram(record(NlMsgType::NOOP, 0, 42, &[]))]);
        sk.set_callbacks(Arc::new(cb));

        let result: Result<u32> = sk.pickup(|msg| crate::attr::get::u32_ne(msg.payload()));
        assert!(matches!(result, Err(Error::NoAnswer)));
    }

    #[test]
    fn test_delivered_message_metadata() {
        let mut sk = test_socket();
        let mut cb = Callbacks::default();
        feed(
            &mut cb,
            vec![Datagram {
                buf: record(FAMILY_TYPE, 0, 42, &[0; 4]),
                src: SocketAddr::new(777, 0),
                creds: None,
            }],
        );

        let seen = Arc::new(Mutex::new(None));
        let out = Arc::clone(&seen);
        cb.set(Event::Valid, move |msg| {
            *out.lock().unwrap() = Some((msg.protocol(), msg.src().port()));
            Ok(Action::Proceed)
        });

        sk.recvmsgs(&cb).unwrap();
        assert_eq!(
            seen.lock().unwrap().unwrap(),
            (Some(Protocol::Route), 777)
        );
    }
}
