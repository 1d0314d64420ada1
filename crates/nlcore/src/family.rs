//! Family lookup hook.
//!
//! The transport core knows nothing about protocol families beyond the
//! control message types. Family-aware collaborators (caches, per-family
//! parsers) implement [`FamilyOps`] so that generic code — message dumping
//! in particular — can locate the attribute region behind a family header
//! and name family-specific message types.

use crate::socket::Protocol;

/// Resolves family-specific knowledge by (protocol, message type).
pub trait FamilyOps {
    /// Size of the family header for this message type, in octets.
    ///
    /// Returns `None` when the (protocol, type) pair is not recognised, in
    /// which case callers fall back to treating the payload as opaque.
    fn header_size(&self, protocol: Protocol, msg_type: u16) -> Option<usize>;

    /// Human-readable name for the message type, e.g. `route/link::new`.
    fn message_name(&self, protocol: Protocol, msg_type: u16) -> Option<String> {
        let _ = (protocol, msg_type);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, NLM_F_MULTI};
    use crate::socket::Protocol;

    struct LinkFamily;

    impl FamilyOps for LinkFamily {
        fn header_size(&self, protocol: Protocol, msg_type: u16) -> Option<usize> {
            (protocol == Protocol::Route && (16..=19).contains(&msg_type)).then_some(16)
        }

        fn message_name(&self, _protocol: Protocol, msg_type: u16) -> Option<String> {
            (msg_type == 16).then(|| "link::new".to_string())
        }
    }

    #[test]
    fn test_dump_walks_attributes_with_family() {
        let mut msg = Message::new_simple(16, NLM_F_MULTI);
        msg.append(&[0u8; 16], 4); // family header
        msg.put_attr_str(3, "lo").unwrap();
        msg.set_protocol(Some(Protocol::Route));

        let mut out = Vec::new();
        msg.dump_with(&mut out, Some(&LinkFamily)).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("<link::new>"));
        assert!(text.contains("[PAYLOAD] 16 octets"));
        assert!(text.contains("[ATTR 03] 3 octets"));
        assert!(text.contains("[PADDING] 1 octets"));
    }

    #[test]
    fn test_unknown_family_falls_back_to_hex() {
        let mut msg = Message::new_simple(99, 0);
        msg.append(&[1u8; 8], 4);
        msg.set_protocol(Some(Protocol::Generic));

        let mut out = Vec::new();
        msg.dump_with(&mut out, Some(&LinkFamily)).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("[PAYLOAD] 8 octets"));
        assert!(!text.contains("[ATTR"));
    }
}
