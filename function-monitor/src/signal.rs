use crate::{AddressSpace, ContextId};

/// A call whose stack pointer could be resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CallEvent {
    pub context: ContextId,
    pub space: AddressSpace,
    /// Address of the call instruction.
    pub pc: u64,
    /// Address of the called function.
    pub target: u64,
    /// Stack pointer at function entry, after the call executed.
    pub stack_pointer: u64,
}

/// A return that resolved a pending call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ReturnEvent {
    pub context: ContextId,
    pub space: AddressSpace,
    /// Address of the return instruction.
    pub pc: u64,
    pub stack_pointer: u64,
    /// The call this return was matched with.
    pub call: CallEvent,
}

pub type ReturnObserver = Box<dyn FnOnce(&ReturnEvent)>;

/// Return observers attached to a single call.
///
/// Every call observer receives its own empty signal. Connecting to it is how an observer asks to
/// be told when this particular invocation returns; observers that do not connect anything cost
/// nothing once the call has been dispatched.
#[derive(Default)]
pub struct ReturnSignal {
    observers: Vec<ReturnObserver>,
}

impl ReturnSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `observer` once, when the call that produced this signal returns.
    pub fn connect<F>(&mut self, observer: F)
    where
        F: FnOnce(&ReturnEvent) + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) fn append(&mut self, mut other: ReturnSignal) {
        self.observers.append(&mut other.observers);
    }

    pub(crate) fn emit(self, event: &ReturnEvent) {
        for observer in self.observers {
            observer(event);
        }
    }
}

impl std::fmt::Debug for ReturnSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReturnSignal")
            .field("observers", &self.observers.len())
            .finish()
    }
}
