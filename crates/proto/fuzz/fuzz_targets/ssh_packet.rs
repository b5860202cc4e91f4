//! Fuzz target for the packet decoder and the message parsers behind it.
//!
//! Run with:
//! ```bash
//! cd crates/proto/fuzz
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tern_proto::ssh::auth::{AuthFailure, InfoRequest};
use tern_proto::ssh::buffer::Buffer;
use tern_proto::ssh::kex::KexInit;
use tern_proto::ssh::packet::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut decoder = Decoder::new();
    decoder.feed(data);
    while let Ok(Some(packet)) = decoder.next_packet() {
        let payload = packet.payload;
        match payload.first() {
            Some(20) => {
                let _ = KexInit::from_bytes(&payload);
            }
            Some(51) => {
                let mut buf = Buffer::from_vec(payload[1..].to_vec());
                let _ = AuthFailure::parse(&mut buf);
            }
            Some(60) => {
                let mut buf = Buffer::from_vec(payload[1..].to_vec());
                let _ = InfoRequest::parse(&mut buf);
            }
            _ => {}
        }
    }
});
