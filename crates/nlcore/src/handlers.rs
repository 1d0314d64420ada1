//! Callback sets customising the transport engine.
//!
//! Every hook is optional; the dispatch loop applies a documented default
//! action for empty slots. Hooks steer the loop through their return value:
//!
//! | Return                | Effect                                        |
//! |-----------------------|-----------------------------------------------|
//! | `Ok(Action::Proceed)` | Continue with whatever comes next             |
//! | `Ok(Action::Skip)`    | Abandon the current record, resume the loop   |
//! | `Ok(Action::Stop)`    | Terminate the loop cleanly                    |
//! | `Err(e)`              | Abort the loop with `e`                       |
//!
//! Three built-in personalities exist: [`Kind::Default`] (all slots empty),
//! [`Kind::Verbose`] (one-line warnings and errors on stdout/stderr) and
//! [`Kind::Debug`] (full decoded dumps of all message traffic).
//!
//! Sets are shared by reference count: a socket holds one `Arc<Callbacks>`,
//! per-call customisation clones the inner value and drops it at the end of
//! the call.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::{flags_str, msg_type_str, Message, NlMsgError, NlMsgHdr};
use crate::socket::{NetlinkSocket, SocketAddr};
use crate::transport::Datagram;

/// Flow-control disposition returned by hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Proceed with whatever comes next.
    Proceed,
    /// Skip the record currently being processed, continue with the next.
    Skip,
    /// Stop the dispatch loop, discarding remaining records in this set.
    Stop,
}

/// Hook slots of a callback set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A family-specific record was delivered.
    Valid,
    /// DONE terminated a multipart stream.
    Finish,
    /// The kernel reported lost data.
    Overrun,
    /// A NOOP record arrived.
    Skipped,
    /// A zero-error ERROR record (acknowledgement) arrived.
    Ack,
    /// First sight of every inbound record.
    MsgIn,
    /// Last sight of every outbound record.
    MsgOut,
    /// Truncated or malformed record, or sequence mismatch.
    Invalid,
    /// Replaces the built-in sequence verification.
    SeqCheck,
    /// The peer asked for an acknowledgement of this record.
    SendAck,
    /// A record carried the DUMP_INTR flag.
    DumpIntr,
}

pub(crate) const EVENT_COUNT: usize = 11;

impl Event {
    /// Every hook slot, in table order.
    pub const ALL: [Event; EVENT_COUNT] = [
        Event::Valid,
        Event::Finish,
        Event::Overrun,
        Event::Skipped,
        Event::Ack,
        Event::MsgIn,
        Event::MsgOut,
        Event::Invalid,
        Event::SeqCheck,
        Event::SendAck,
        Event::DumpIntr,
    ];
}

/// Built-in callback personalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// All slots empty, default actions apply.
    Default,
    /// Print warnings and errors as they happen.
    Verbose,
    /// Print a decoded trace of every message and lifecycle event.
    Debug,
}

/// Per-record hook.
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<Action> + Send + Sync>;

/// Error-record hook: peer address plus decoded error body.
pub type ErrorHandler = Arc<dyn Fn(&SocketAddr, &NlMsgError) -> Result<Action> + Send + Sync>;

/// Replacement for the default send primitive.
pub type SendOverride = Arc<dyn Fn(&mut NetlinkSocket, &mut Message) -> Result<usize> + Send + Sync>;

/// Replacement for the default receive-one primitive.
pub type RecvOverride =
    Arc<dyn Fn(&mut NetlinkSocket) -> Result<Option<Datagram>> + Send + Sync>;

/// Replacement for the whole receive loop.
pub type RecvMsgsOverride =
    Arc<dyn Fn(&mut NetlinkSocket, &Callbacks) -> Result<usize> + Send + Sync>;

/// A bundle of hooks consulted by the transport engine.
#[derive(Clone)]
pub struct Callbacks {
    handlers: [Option<MessageHandler>; EVENT_COUNT],
    err: Option<ErrorHandler>,
    send_ow: Option<SendOverride>,
    recv_ow: Option<RecvOverride>,
    recvmsgs_ow: Option<RecvMsgsOverride>,
}

impl Callbacks {
    /// Allocate a set pre-filled from the built-in table for `kind`.
    pub fn new(kind: Kind) -> Self {
        let mut cb = Self {
            handlers: std::array::from_fn(|_| None),
            err: None,
            send_ow: None,
            recv_ow: None,
            recvmsgs_ow: None,
        };
        for event in Event::ALL {
            cb.set_default(event, kind);
        }
        cb.set_err_default(kind);
        cb
    }

    /// Install a custom hook for `event`.
    pub fn set<F>(&mut self, event: Event, f: F)
    where
        F: Fn(&Message) -> Result<Action> + Send + Sync + 'static,
    {
        self.handlers[event as usize] = Some(Arc::new(f));
    }

    /// Install a pre-built hook for `event`, or clear the slot with `None`.
    pub fn set_handler(&mut self, event: Event, handler: Option<MessageHandler>) {
        self.handlers[event as usize] = handler;
    }

    /// Install the built-in hook of `kind` for `event`.
    pub fn set_default(&mut self, event: Event, kind: Kind) {
        self.handlers[event as usize] = builtin(event, kind);
    }

    /// Install one custom hook in every slot.
    pub fn set_all<F>(&mut self, f: F)
    where
        F: Fn(&Message) -> Result<Action> + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(f);
        for event in Event::ALL {
            self.handlers[event as usize] = Some(handler.clone());
        }
    }

    /// Fill every slot from the built-in table for `kind`.
    pub fn set_all_default(&mut self, kind: Kind) {
        for event in Event::ALL {
            self.set_default(event, kind);
        }
    }

    /// Install a custom error hook.
    pub fn set_err<F>(&mut self, f: F)
    where
        F: Fn(&SocketAddr, &NlMsgError) -> Result<Action> + Send + Sync + 'static,
    {
        self.err = Some(Arc::new(f));
    }

    /// Install the built-in error hook of `kind`.
    pub fn set_err_default(&mut self, kind: Kind) {
        self.err = builtin_err(kind);
    }

    /// Replace the engine's send primitive.
    pub fn overwrite_send<F>(&mut self, f: F)
    where
        F: Fn(&mut NetlinkSocket, &mut Message) -> Result<usize> + Send + Sync + 'static,
    {
        self.send_ow = Some(Arc::new(f));
    }

    /// Replace the engine's receive-one primitive.
    pub fn overwrite_recv<F>(&mut self, f: F)
    where
        F: Fn(&mut NetlinkSocket) -> Result<Option<Datagram>> + Send + Sync + 'static,
    {
        self.recv_ow = Some(Arc::new(f));
    }

    /// Replace the engine's receive loop.
    pub fn overwrite_recvmsgs<F>(&mut self, f: F)
    where
        F: Fn(&mut NetlinkSocket, &Callbacks) -> Result<usize> + Send + Sync + 'static,
    {
        self.recvmsgs_ow = Some(Arc::new(f));
    }

    /// The hook installed for `event`, if any.
    pub fn handler(&self, event: Event) -> Option<&MessageHandler> {
        self.handlers[event as usize].as_ref()
    }

    /// The installed error hook, if any.
    pub fn err_handler(&self) -> Option<&ErrorHandler> {
        self.err.as_ref()
    }

    /// Invoke the hook for `event` on `msg`; `None` when the slot is empty.
    pub fn call(&self, event: Event, msg: &Message) -> Option<Result<Action>> {
        self.handler(event).map(|hook| (**hook)(msg))
    }

    /// Invoke the error hook; `None` when the slot is empty.
    pub fn call_err(&self, who: &SocketAddr, e: &NlMsgError) -> Option<Result<Action>> {
        self.err_handler().map(|hook| (**hook)(who, e))
    }

    pub(crate) fn send_override(&self) -> Option<&SendOverride> {
        self.send_ow.as_ref()
    }

    pub(crate) fn recv_override(&self) -> Option<&RecvOverride> {
        self.recv_ow.as_ref()
    }

    pub(crate) fn recvmsgs_override(&self) -> Option<&RecvMsgsOverride> {
        self.recvmsgs_ow.as_ref()
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new(Kind::Default)
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installed: Vec<Event> = Event::ALL
            .into_iter()
            .filter(|e| self.handlers[*e as usize].is_some())
            .collect();
        f.debug_struct("Callbacks")
            .field("installed", &installed)
            .field("err", &self.err.is_some())
            .field("send_ow", &self.send_ow.is_some())
            .field("recv_ow", &self.recv_ow.is_some())
            .field("recvmsgs_ow", &self.recvmsgs_ow.is_some())
            .finish()
    }
}

/// One-line summary of a message header, as printed by the verbose hooks.
pub fn header_line(hdr: &NlMsgHdr) -> String {
    format!(
        "type={} length={} flags=<{}> sequence-nr={} pid={}",
        msg_type_str(hdr.nlmsg_type),
        hdr.nlmsg_len,
        flags_str(hdr.nlmsg_flags),
        hdr.nlmsg_seq,
        hdr.nlmsg_pid
    )
}

fn builtin(event: Event, kind: Kind) -> Option<MessageHandler> {
    match kind {
        Kind::Default => None,
        Kind::Verbose => match event {
            Event::Valid => Some(Arc::new(|msg| {
                println!(
                    "-- Warning: unhandled valid message: {}",
                    header_line(&msg.header())
                );
                Ok(Action::Proceed)
            })),
            Event::Invalid => Some(invalid_verbose()),
            Event::Overrun => Some(overrun_verbose()),
            _ => None,
        },
        Kind::Debug => match event {
            Event::Valid => Some(Arc::new(|msg| {
                eprintln!(
                    "-- Debug: Unhandled Valid message: {}",
                    header_line(&msg.header())
                );
                Ok(Action::Proceed)
            })),
            Event::Finish => Some(Arc::new(|msg| {
                eprintln!(
                    "-- Debug: End of multipart message block: {}",
                    header_line(&msg.header())
                );
                Ok(Action::Stop)
            })),
            Event::Invalid => Some(invalid_verbose()),
            Event::Overrun => Some(overrun_verbose()),
            Event::MsgIn => Some(Arc::new(|msg| {
                let mut err = io::stderr().lock();
                let _ = writeln!(err, "-- Debug: Received Message:");
                let _ = msg.dump(&mut err);
                Ok(Action::Proceed)
            })),
            Event::MsgOut => Some(Arc::new(|msg| {
                let mut err = io::stderr().lock();
                let _ = writeln!(err, "-- Debug: Sent Message:");
                let _ = msg.dump(&mut err);
                Ok(Action::Proceed)
            })),
            Event::Skipped => Some(Arc::new(|msg| {
                eprintln!("-- Debug: Skipped message: {}", header_line(&msg.header()));
                Ok(Action::Skip)
            })),
            Event::Ack => Some(Arc::new(|msg| {
                eprintln!("-- Debug: ACK: {}", header_line(&msg.header()));
                Ok(Action::Stop)
            })),
            _ => None,
        },
    }
}

fn invalid_verbose() -> MessageHandler {
    Arc::new(|msg| {
        eprintln!("-- Error: Invalid message: {}", header_line(&msg.header()));
        Ok(Action::Stop)
    })
}

fn overrun_verbose() -> MessageHandler {
    Arc::new(|msg| {
        eprintln!("-- Error: Netlink Overrun: {}", header_line(&msg.header()));
        Ok(Action::Stop)
    })
}

fn builtin_err(kind: Kind) -> Option<ErrorHandler> {
    match kind {
        Kind::Default => None,
        Kind::Verbose | Kind::Debug => Some(Arc::new(|_who, e| {
            eprintln!(
                "-- Error received: {}\n-- Original message: {}",
                io::Error::from_raw_os_error(-e.error),
                header_line(&e.msg)
            );
            Err(Error::from_errno(e.error))
        })),
    }
}
