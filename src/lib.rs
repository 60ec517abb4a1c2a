//! This crate implements an in-place dynamic memory allocator based on the
//! TLSF (Two-Level Segregated Fit) algorithm¹.
//!
//!  - **Allocation, deallocation, and in-place resizing are guaranteed to
//!    complete in constant time**, independent of the arena size and of the
//!    fragmentation history. TLSF is suitable for real-time applications.
//!
//!  - **The whole allocator lives inside a caller-supplied arena.**
//!    [`Tlsf::emplace`] places the control structure and the free-list
//!    directory at the start of the arena and manages the rest in place; the
//!    core never calls back into a system allocator.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ```rust
//! use tlsf_arena::{Tlsf, GRANULARITY};
//! use std::mem::MaybeUninit;
//!
//! let mut arena = [MaybeUninit::uninit(); 65536];
//!
//! // The control structure is emplaced at the start of `arena`. `u16` bitmap
//! // words, 12 first-level and 16 second-level classes can track free blocks
//! // of up to `(GRANULARITY << 12) - GRANULARITY` bytes.
//! let tlsf: &mut Tlsf<u16, u16, 12, 16> = Tlsf::emplace(&mut arena);
//!
//! unsafe {
//!     let mut ptr1 = tlsf.allocate(GRANULARITY).unwrap().cast::<u64>();
//!     let mut ptr2 = tlsf.allocate(GRANULARITY).unwrap().cast::<u64>();
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!     tlsf.deallocate(ptr1.cast());
//!     tlsf.deallocate(ptr2.cast());
//! }
//! ```
//!
//! # Contract
//!
//! All sizes passed to [`Tlsf::allocate`] and [`Tlsf::reallocate`] must be
//! multiples of [`GRANULARITY`] (two machine words); the content addresses
//! handed out are aligned likewise. Misaligned sizes, double frees, and
//! pointers foreign to the instance are contract violations checked by debug
//! assertions only - release builds omit the checks to preserve predictable,
//! overhead-free latency.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

pub mod int;
mod tlsf;
mod utils;
pub use self::tlsf::{Tlsf, GRANULARITY};

#[cfg(any(test, feature = "std"))]
extern crate std;
