//! Correlation of function calls with their returns.
//!
//! An execution engine reports every call and return it executes to a [`FunctionMonitor`].
//! Observers register interest in calls to a specific address, or in every call, and may attach
//! return observers to each individual call. The monitor keeps a pending entry for every call
//! that has return observers attached and fires them when the matching return executes.
//!
//! Calls and returns are matched on the stack pointer (the value right after the call, which is
//! the value again right after the return), the execution context, and the address space. This
//! keeps recursion and divergent execution contexts apart without tracking a shadow stack.

pub mod error;
pub mod log;
pub mod logger;
pub mod monitor;
pub mod registry;
pub mod signal;

pub use error::MonitorError;
pub use logger::CallLogger;
pub use monitor::FunctionMonitor;
pub use registry::{CallObserver, Subscription};
pub use signal::{CallEvent, ReturnEvent, ReturnSignal};

/// Identifies one divergent execution timeline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

/// Identifies an isolated virtual address space, such as a process.
///
/// [`AddressSpace::ANY`] is only meaningful when registering call observers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpace(pub u64);

impl AddressSpace {
    /// Wildcard that matches calls in every address space.
    pub const ANY: Self = Self(0);

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    /// Returns true if a registration for `self` applies to an event in `space`.
    pub fn matches(&self, space: AddressSpace) -> bool {
        self.is_any() || *self == space
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The view of an execution engine's state needed to correlate calls and returns.
pub trait ExecutionState {
    fn context(&self) -> ContextId;

    fn address_space(&self) -> AddressSpace;

    /// Returns the program counter of the instruction being executed.
    fn pc(&self) -> u64;

    /// Returns the stack pointer, or `None` if it does not hold a single concrete value.
    fn stack_pointer(&self) -> Option<u64>;
}

/// A plain copy of the values an [`ExecutionState`] provides.
///
/// Engines that already have these values at hand (and tests) can use this instead of
/// implementing [`ExecutionState`] themselves.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Snapshot {
    pub context: ContextId,
    pub space: AddressSpace,
    pub pc: u64,
    pub stack_pointer: Option<u64>,
}

impl Snapshot {
    pub fn new(context: ContextId, space: AddressSpace, pc: u64, stack_pointer: Option<u64>) -> Self {
        Self {
            context,
            space,
            pc,
            stack_pointer,
        }
    }
}

impl ExecutionState for Snapshot {
    fn context(&self) -> ContextId {
        self.context
    }

    fn address_space(&self) -> AddressSpace {
        self.space
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn stack_pointer(&self) -> Option<u64> {
        self.stack_pointer
    }
}
