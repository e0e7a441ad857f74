use crate::log::Hex;
use crate::monitor::{FunctionMonitor, ANY_TARGET};
use crate::registry::{CallObserver, Subscription};
use crate::signal::{CallEvent, ReturnSignal};
use crate::AddressSpace;

/// Logs every call and its return, numbering functions in the order they were called.
#[derive(Debug, Default)]
pub struct CallLogger {
    next: u64,
}

impl CallLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new logger for every call in every address space.
    pub fn attach(monitor: &mut FunctionMonitor) -> Subscription {
        monitor.register_call_observer(ANY_TARGET, AddressSpace::ANY, Self::new())
    }
}

impl CallObserver for CallLogger {
    fn on_call(&mut self, call: &CallEvent, returns: &mut ReturnSignal) {
        let function = self.next;
        self.next += 1;

        tracing::info! {
            function = function,
            context = %call.context,
            pc = %Hex(call.pc),
            callee = %Hex(call.target),
            "calling function"
        };

        returns.connect(move |ret| {
            tracing::info! {
                function = function,
                context = %ret.context,
                pc = %Hex(ret.pc),
                "returning from function"
            };
        });
    }
}
