#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use segfit_fuzzing::Ops;

/// Live requested bytes are capped at the size of the backing pool.
const ALLOCATION_LIMIT: usize = 1 << 20;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // With probability of about 1/8, just use the default mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = bincode::decode_from_slice::<Ops, _>(&data[..size], bincode_config())
        .map_or_else(|_decode_err| Ops::default(), |(ops, _)| ops);

    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);

    if session.mutate(&mut ops).is_ok() {
        // Re-encode, dropping ops off the end until the encoding fits.
        loop {
            if let Ok(new_size) = bincode::encode_into_slice(&ops, &mut data[..max_size], bincode_config()) {
                return new_size;
            }
            if !ops.pop() {
                break;
            }
        }
    }

    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Ok((ops, _)) = bincode::decode_from_slice::<Ops, _>(data, bincode_config()) {
        if let Err(e) = ops.run(ALLOCATION_LIMIT) {
            panic!("error: {e}");
        }
    }
});
