//! Synchronous netlink transport core for Linux.
//!
//! This crate implements the protocol plumbing every netlink client needs
//! and nothing family-specific: socket lifecycle, message framing and
//! alignment, attribute trees, outbound completion and the inbound
//! callback-driven dispatch loop with multipart and dump-interrupt
//! handling. Family parsers, object caches and command-line front ends are
//! expected to plug into the hook surfaces exposed here.
//!
//! # Quick Start
//!
//! ```ignore
//! use nlcore::{Callbacks, Event, Action, Message, NetlinkSocket, Protocol};
//! use nlcore::message::{NLM_F_DUMP, NLM_F_REQUEST};
//!
//! let mut sock = NetlinkSocket::new();
//! sock.connect(Protocol::Route)?;
//!
//! // Dump all links: RTM_GETLINK plus a zeroed ifinfomsg header.
//! let mut msg = Message::new_simple(18, NLM_F_REQUEST | NLM_F_DUMP);
//! msg.append(&[0u8; 16], 4);
//! sock.send_auto(&mut msg)?;
//!
//! let mut cb = Callbacks::default();
//! cb.set(Event::Valid, |msg| {
//!     println!("link record, {} payload octets", msg.payload_len());
//!     Ok(Action::Proceed)
//! });
//! let records = sock.recvmsgs_report(&cb)?;
//! ```
//!
//! # Customisation
//!
//! All engine behaviour funnels through [`Callbacks`]: per-event hooks with
//! [`Action`] dispositions, an error hook for non-zero error records, and
//! full overrides for the send, receive and receive-loop primitives. See
//! the [`handlers`] module docs for the event table and defaults.

pub mod attr;
pub mod error;
pub mod family;
pub mod handlers;
pub mod message;
pub mod socket;
pub mod transport;

pub use attr::{AttrDataType, AttrIter, AttrPolicy, NestToken, NlAttr};
pub use error::{Error, Result};
pub use family::FamilyOps;
pub use handlers::{Action, Callbacks, Event, Kind};
pub use message::{Message, MessageIter, NlMsgError, NlMsgHdr, NlMsgType, NLMSG_HDRLEN};
pub use socket::{Credentials, NetlinkSocket, Protocol, SocketAddr};
pub use transport::Datagram;
