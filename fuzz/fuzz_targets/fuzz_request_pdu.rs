#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_modbus_server::{DataBank, ProtocolEngine, RegisterTable};

#[derive(Debug, Arbitrary)]
struct Input {
    base: u16,
    len: u8,
    pdu: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let size = input.len as usize;
    let bank = DataBank::new(
        RegisterTable::filled(input.base, size, false),
        RegisterTable::filled(input.base, size, true),
        RegisterTable::filled(input.base, size, 0),
        RegisterTable::filled(input.base, size, 0xFFFF),
    );
    let mut engine = ProtocolEngine::new(1, bank);
    let Some(&fc) = input.pdu.first() else {
        return;
    };

    // every request gets a response: success with the same code, or an exception
    let response = engine.process_pdu(&input.pdu);
    let code = response.function_code();
    assert!(code == Some(fc) || code == Some(fc | 0x80));
    if response.is_exception() {
        assert_eq!(response.len(), 2);
    }
});
