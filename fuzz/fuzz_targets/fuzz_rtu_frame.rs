#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_modbus_server::{
    codec::crc16_bytes, DataBank, FrameOutcome, ProtocolEngine, RegisterTable, RtuFraming,
};

fn engine() -> ProtocolEngine {
    let bank = DataBank::new(
        RegisterTable::filled(100, 10, true),
        RegisterTable::filled(0, 10, false),
        RegisterTable::filled(200, 100, 42),
        RegisterTable::filled(1000, 10, 1),
    );
    ProtocolEngine::new(1, bank)
}

fuzz_target!(|data: &[u8]| {
    let mut engine = engine();

    // raw bytes: almost always rejected by the CRC check
    let _ = engine.handle_frame(&RtuFraming, data);

    // same bytes behind a valid id and CRC reach the dispatcher
    let mut frame = vec![1u8];
    frame.extend_from_slice(data);
    let crc = crc16_bytes(&frame);
    frame.extend_from_slice(&crc);

    if let FrameOutcome::Response(response) = engine.handle_frame(&RtuFraming, &frame) {
        assert!(response.len() >= 5);
        assert_eq!(response[0], 1);
        let (body, trailer) = response.split_at(response.len() - 2);
        assert_eq!(&crc16_bytes(body)[..], trailer);
    }
});
