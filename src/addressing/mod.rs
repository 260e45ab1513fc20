//! Instance addressing.
//!
//! Server-minted instance ids and the client cache that waits for them.

pub mod client;
pub mod server;

pub use client::{AddressBook, AddressingError, PendingInstance};
pub use server::{Addressable, Allocation, InstanceAllocator};
