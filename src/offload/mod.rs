//! kernel-facing half of the control plane: pinned map wrappers and the
//! XDP program loader.

/// Typed wrappers over the pinned eBPF maps
pub mod maps;

/// BPF object loading, constant rewriting and attach modes
pub mod xdp;
