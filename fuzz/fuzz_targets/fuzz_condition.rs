#![no_main]

use libfuzzer_sys::fuzz_target;
use prifma::pipeline::{Cidr, Condition};

fuzz_target!(|data: &[u8]| {
    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    let _ = Cidr::parse(input);

    let mut parts = input.splitn(3, ' ');
    if let (Some(key), Some(op), Some(value)) = (parts.next(), parts.next(), parts.next()) {
        let _ = Condition::new(key, op, value);
    }
});
