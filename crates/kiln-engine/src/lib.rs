//! Kiln Runtime Engine
//!
//! This crate provides the two tightly-coupled halves of the kiln
//! managed-runtime execution engine:
//! - **Exec**: managed code heaps, the global executable-range registry,
//!   jump stubs, and OS unwind-table publication (`exec` module)
//! - **JIT**: the IR surface and the physical struct promotion phase
//!   (`jit` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_engine::exec::{CodeRequest, ExecutionManager, HeapKind, MethodHandle};
//!
//! let manager = ExecutionManager::with_null_unwind();
//! let alloc = manager.allocate_method_code(&request, MethodHandle(1))?;
//! assert!(manager.is_managed_code(alloc.code));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Exec module: code heaps, range registry, jump stubs, unwind tables
pub mod exec;

/// JIT module: IR surface and physical struct promotion
pub mod jit;

// ============================================================================
// Re-exports from Exec
// ============================================================================

pub use exec::{
    // Facade
    ExecutionManager, CodeAllocation,
    // Heaps and identity
    AllocatorId, CodeBlockHeader, CodeHeap, CodeRequest, HeapKind, MethodHandle, StubKind,
    // Registry
    RangeMap, RangeSection, SectionTarget,
    // Jump stubs
    JumpStubManager, StubScope,
    // Unwind publication
    EntryKind, NullUnwindOs, RuntimeFunction, UnwindOs, UnwindRecord, UnwindTable,
    // AOT images
    AotImage, AotMethod,
    // Errors
    CodeMemError,
};

// ============================================================================
// Re-exports from JIT
// ============================================================================

pub use jit::ir::{
    BasicBlock, BlockId, ClassLayout, FieldDef, LayoutFlags, LayoutId, LocalDesc, LocalId,
    LocalType, MethodIr, NodeId, NodeKind, PrimType, Statement,
};
pub use jit::promotion::{
    AggregateInfo, AggregateStore, PhaseStatus, PromotionConfig, PromotionLiveness, Replacement,
    StructDeaths, StructSegments,
};
