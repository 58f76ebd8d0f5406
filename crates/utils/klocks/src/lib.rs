#![cfg_attr(not(test), no_std)]

mod kspin;

pub use kspin::{SpinMutex, SpinMutexGuard};
