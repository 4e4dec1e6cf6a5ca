//! Fuzz target for inbound line parsing.
//!
//! Every line from stdin goes through `parse_line`, so it must never panic,
//! and anything it accepts as a request must survive a reply round.

#![no_main]

use broadcast_engine::protocol::{parse_line, to_line, Body, Inbound, Message, Payload};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    // Should never panic
    let Ok(inbound) = parse_line(line) else {
        return;
    };

    if let Inbound::Request { src, dest, msg_id, request } = inbound {
        let payload = match request {
            Ok(_) => Payload::BroadcastOk,
            Err(err) => Payload::error(&err),
        };
        let reply = Message {
            src: dest,
            dest: src,
            body: Body {
                msg_id: None,
                in_reply_to: msg_id,
                payload,
            },
        };
        // Replies to anything we parsed must encode.
        assert!(to_line(&reply).is_ok());
    }
});
