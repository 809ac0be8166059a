//! Backend Frame and Topic Tests
//!
//! How the gateway builds what it sends back to the backend:
//! - Error replies carry the failing request's opcode
//! - Reply topics reuse the alias found on the inbound topic

use acgw_core::{
    topic, Apdu, MessageError, TopicInfo, TopicKind, TranslateError, MESSAGE_ERROR, REPLY_FLAG,
};
use prost::Message;

#[test]
fn test_error_reply_wire_format() {
    let request = Apdu::new(0x0000_0302, b"payload".to_vec());
    let err = TranslateError::Unsupported(request.message_id);
    let reply = request.error_reply(err.code(), err.to_string());

    let decoded = Apdu::from_bytes(&reply.to_bytes()).unwrap();
    assert_eq!(decoded.message_id, MESSAGE_ERROR);
    assert!(decoded.is_request());
    assert!(decoded.is_error());

    let inner = MessageError::decode(decoded.payload.as_slice()).unwrap();
    assert_eq!(inner.request_id, 0x0000_0302);
    assert_eq!(inner.code, err.code());
    assert_eq!(inner.description, "unsupported message id 0x00000302");
}

#[test]
fn test_reply_of_reply_is_not_a_request() {
    let request = Apdu::new(0x0102, vec![]);
    let reply = Apdu::new(request.reply_id(), vec![]);
    assert_eq!(reply.message_id, 0x0102 | REPLY_FLAG);
    assert!(reply.is_reply());
    assert!(reply.as_error().is_none());
}

#[test]
fn test_translate_error_codes_are_distinct() {
    let codes = [
        TranslateError::Other(String::new()).code(),
        TranslateError::Decode(String::new()).code(),
        TranslateError::Encode(String::new()).code(),
        TranslateError::Unsupported(0).code(),
    ];
    for (i, a) in codes.iter().enumerate() {
        for b in &codes[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn test_inbound_alias_routes_reply() {
    let shapes = [
        ("gw01/command/42", None),
        ("gw01/core-a/command/42", Some("core-a")),
        ("gw01/42/command", None),
        ("gw01/core-a/42/command", Some("core-a")),
    ];

    for (inbound, alias) in shapes {
        let info = TopicInfo::parse(inbound, "gw01").unwrap();
        assert_eq!(info.kind, TopicKind::Command, "{}", inbound);
        assert_eq!(info.device_id, "42", "{}", inbound);
        assert_eq!(info.backend_alias.as_deref(), alias, "{}", inbound);

        let reply = topic::uplink_topic(
            info.backend_alias.as_deref(),
            "gw01",
            info.kind,
            &info.device_id,
        );
        assert_eq!(reply, format!("{}/gw01/command/42", alias.unwrap_or("coregw")));
    }
}

#[test]
fn test_every_inbound_shape_matches_a_filter() {
    let filters = topic::subscription_filters("gw01");
    for kind in TopicKind::ALL {
        for inbound in [
            format!("gw01/{}/7", kind),
            format!("gw01/x/{}/7", kind),
            format!("gw01/7/{}", kind),
            format!("gw01/x/7/{}", kind),
        ] {
            assert!(
                filters.iter().any(|f| matches_filter(f, &inbound)),
                "no filter for {}",
                inbound
            );
        }
    }
}

fn matches_filter(filter: &str, topic: &str) -> bool {
    let f: Vec<&str> = filter.split('/').collect();
    let t: Vec<&str> = topic.split('/').collect();
    f.len() == t.len() && f.iter().zip(&t).all(|(f, t)| *f == "+" || f == t)
}
