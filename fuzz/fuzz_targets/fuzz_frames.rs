#![no_main]

use libfuzzer_sys::fuzz_target;
use peer_link::core::codec::FrameAssembler;
use peer_link::core::envelope::{DataMessage, Envelope};
use peer_link::protocol::control::ControlMessage;

fuzz_target!(|data: &[u8]| {
    // Arbitrary socket bytes: framing, envelope and body decoding must never panic
    let mut assembler = FrameAssembler::new(64 * 1024, 512);
    assembler.push(data);
    while let Ok(Some(frame)) = assembler.next_frame() {
        let Ok(envelope) = Envelope::from_payload(&frame) else {
            break;
        };
        if envelope.is_control() {
            let _ = ControlMessage::from_body(&envelope.body);
        } else {
            let _ = DataMessage::from_body(&envelope.body);
        }
    }
});
