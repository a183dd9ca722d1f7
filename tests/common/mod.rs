#![allow(dead_code)]

use uthread::{Runtime, RuntimeBuilder};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A builder without preemption ticks, so that the interleaving of threads
/// only depends on the program.
pub fn builder() -> RuntimeBuilder {
    init_log();
    RuntimeBuilder::new().tick(None)
}

pub fn runtime() -> Runtime {
    builder().build().unwrap()
}
