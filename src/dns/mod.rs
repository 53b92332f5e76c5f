//! DNS wire handling: packet buffers, protocol types, the fixed width
//! key codec shared with the kernel, TSIG signing and the transfer client.

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Fixed 48-byte label form of names used as kernel map keys
pub mod packed;

/// TSIG transaction signatures for transfer requests
pub mod tsig;

/// Client for SOA probes, AXFR/IXFR transfers and HTTP zone fetches
pub mod client;
