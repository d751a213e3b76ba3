//! Managed code heaps and the runtime-function registry
//!
//! Everything the runtime needs to own executable memory and answer
//! "what code is at this address":
//! - [`virtual_mem`]: OS page reserve/commit/protect.
//! - [`nibble_map`]: constant-time address→block-start reverse index.
//! - [`code_heap`]: executable pools with bump/free-list allocation and a
//!   jump-stub reserve.
//! - [`range_map`]: the global sorted list of executable ranges with
//!   lock-free readers.
//! - [`jump_stub`]: jump thunks placed under absolute-range constraints.
//! - [`unwind`]: OS growable-function-table publication.
//! - [`aot`]: ahead-of-time images sharing the range-section contract.
//! - [`manager`]: the facade tying the above together.

pub mod aot;
pub mod code_heap;
pub mod error;
pub mod jump_stub;
pub mod manager;
pub mod nibble_map;
pub mod range_map;
pub mod unwind;
pub mod virtual_mem;

pub use aot::{AotImage, AotMethod};
pub use code_heap::{
    AllocatorId, CodeBlockHeader, CodeHeap, CodeRequest, HeapKind, MethodHandle, StubKind,
};
pub use error::CodeMemError;
pub use jump_stub::{JumpStubManager, StubScope, JUMP_STUB_BYTES};
pub use manager::{CodeAllocation, ExecutionManager};
pub use nibble_map::NibbleMap;
pub use range_map::{RangeMap, RangeSection, SectionTarget};
pub use unwind::{
    EntryKind, NullUnwindOs, OsTableHandle, RuntimeFunction, UnwindOs, UnwindRecord, UnwindTable,
};
pub use virtual_mem::Reservation;
