//! one-shot privilege escalation for a single vulnerable embedded ARM
//! kernel build.
//!
//! the kernel's page allocator walks an in-band free list while committing a
//! multi-page mapping, and that syscall is slow enough that a sibling thread
//! sees the first page appear in userland long before the operation settles.
//! an address-arbitration call doubles as the oracle for that instant.
//! redirecting the exposed chunk's forward link at a freshly created event
//! object (whose kernel address leaks out of the creation syscall's second
//! output register) makes the allocator map the object's slab page into
//! userland as "the next free chunk". from there the object's dispatch-table
//! pointer is aimed at a table of pointers to [`payload::kernel_entry`], and
//! releasing the object makes the kernel execute the payload with full
//! privilege: it blanks the syscall access-control check, zeroes the calling
//! process's privilege identifier and raises a flag userland spins on.
//!
//! everything runs against the [`svc::Platform`] trait. tests drive the
//! whole chain, timing included, against an in-process kernel simulator;
//! a hardware build supplies the real syscalls instead.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use slabhax::{Exploit, ProcessState};
//! # fn hardware() -> Arc<dyn slabhax::svc::Platform> { unimplemented!() }
//! let state = ProcessState::new();
//! let exploit = Exploit::new(hardware(), state.clone());
//! match exploit.run() {
//!     Ok(()) => log::info!("kernel patched"),
//!     Err(err) => log::error!("{}", err),
//! }
//! ```

pub mod chunk;
pub mod exploit;
pub mod layout;
pub mod payload;
pub mod race;
pub mod svc;


pub use exploit::{Exploit, ExploitError, ProcessState};
