//! Guest-architecture types. The emulator adapter this crate drives targets x86-64; a future
//! additional guest architecture would land as a sibling module here.

pub mod x86_64;
