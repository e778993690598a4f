#![no_main]

use libfuzzer_sys::fuzz_target;
use prifma::conf::{Block, Command, Decoder, Tokenizer};
use prifma::Result;

/// Accepts every directive and block, so only the tokenizer and parser run.
struct AcceptAll;

impl Block for AcceptAll {
    fn call(&mut self, _command: &Command) -> Result<()> {
        Ok(())
    }

    fn call_block(&mut self, _command: &Command) -> Result<Box<dyn Block>> {
        Ok(Box::new(AcceptAll))
    }
}

fuzz_target!(|data: &[u8]| {
    for _ in Tokenizer::new(data) {}

    let input = match std::str::from_utf8(data) {
        Ok(s) => s,
        Err(_) => return,
    };

    // No includes: nothing is read from or written to disk
    let _ = Decoder::without_includes().decode_str(&mut AcceptAll, input);
});
