//! Key-indexed slot store bridging producers, consumers and webhook triggers.
//!
//! A slot is created the first time a key is put, got or registered, and holds:
//! - the key's FIFO of pending bodies
//! - at most one webhook binding (first registration wins)
//! - a wakeup for consumers blocked on an empty queue

mod binding;
mod store;

pub use binding::WebhookBinding;
pub use store::{DequeueError, Slot, SlotStore};
