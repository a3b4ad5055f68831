#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_modbus_server::{DataBank, FrameOutcome, ProtocolEngine, TcpFraming};

fuzz_target!(|data: &[u8]| {
    let mut engine = ProtocolEngine::new(1, DataBank::default());

    if let FrameOutcome::Response(response) = engine.handle_frame(&TcpFraming, data) {
        // transaction id echoed, protocol id zero, length matches the body
        assert_eq!(response[..2], data[..2]);
        assert_eq!(response[2..4], [0, 0]);
        let length = u16::from_be_bytes([response[4], response[5]]) as usize;
        assert_eq!(length, response.len() - 6);
    }
});
