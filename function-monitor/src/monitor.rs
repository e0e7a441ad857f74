use hashbrown::HashMap;

use crate::error::MonitorError;
use crate::log::Hex;
use crate::registry::{CallObserver, CallSites, Subscription};
use crate::signal::{CallEvent, ReturnEvent, ReturnSignal};
use crate::{AddressSpace, ContextId, ExecutionState};

/// Address used to register observers that fire on every call.
pub const ANY_TARGET: u64 = 0;

/// Return observers waiting for the call that attached them to return.
#[derive(Debug)]
struct PendingReturn {
    call: CallEvent,
    signal: ReturnSignal,
}

impl PendingReturn {
    fn matches(&self, context: ContextId, space: AddressSpace) -> bool {
        self.call.context == context && self.call.space == space
    }
}

/// Correlates calls with their returns and dispatches both to registered observers.
///
/// The monitor does no locking of its own. Engines that raise events from more than one thread
/// have to serialize their calls into it.
#[derive(Default)]
pub struct FunctionMonitor {
    call_sites: CallSites,
    /// Pending returns keyed by the stack pointer at function entry, oldest first.
    returns: HashMap<u64, Vec<PendingReturn>>,
    pending: usize,
}

impl FunctionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` for calls to `target` in `space`.
    ///
    /// A `target` of [`ANY_TARGET`] observes every call, and a `space` of [`AddressSpace::ANY`]
    /// observes calls in every address space.
    pub fn register_call_observer<O>(
        &mut self,
        target: u64,
        space: AddressSpace,
        observer: O,
    ) -> Subscription
    where
        O: CallObserver + 'static,
    {
        tracing::debug!(callee = %Hex(target), space = %space, "registering call observer");
        self.call_sites.register(target, space, Box::new(observer))
    }

    pub fn unregister(&mut self, subscription: Subscription) -> Result<(), MonitorError> {
        if self.call_sites.unregister(subscription) {
            Ok(())
        } else {
            Err(MonitorError::UnknownSubscription(subscription))
        }
    }

    /// Handles a call to `target` executed in `state`.
    ///
    /// Catch-all observers fire first, followed by the observers registered for `target`. If any
    /// of them attached return observers, they are kept until the matching return.
    pub fn on_call<S>(&mut self, state: &S, target: u64)
    where
        S: ExecutionState + ?Sized,
    {
        let context = state.context();
        let space = state.address_space();
        let pc = state.pc();

        let _span = tracing::trace_span! {
            "on_call",
            context = %context,
            space = %space,
            pc = %Hex(pc),
        }
        .entered();

        let Some(stack_pointer) = state.stack_pointer() else {
            tracing::warn! {
                pc = %Hex(pc),
                space = %space,
                "function call with symbolic stack pointer"
            };
            return;
        };

        let call = CallEvent {
            context,
            space,
            pc,
            target,
            stack_pointer,
        };

        let mut returns = ReturnSignal::new();
        let mut fired = self.call_sites.dispatch(ANY_TARGET, &call, &mut returns);
        // Calls to address zero have already been dispatched as catch-alls.
        if target != ANY_TARGET {
            fired += self.call_sites.dispatch(target, &call, &mut returns);
        }

        tracing::trace! {
            callee = %Hex(target),
            sp = %Hex(stack_pointer),
            observers = fired,
            return_observers = returns.len(),
            "dispatched call"
        };

        if returns.is_empty() {
            return;
        }

        self.returns
            .entry(stack_pointer)
            .or_default()
            .push(PendingReturn {
                call,
                signal: returns,
            });
        self.pending += 1;
    }

    /// Handles a return executed in `state`.
    ///
    /// Resolves at most one pending call: the oldest one recorded under the current stack
    /// pointer for the same context and address space. Returns that match nothing are ignored.
    pub fn on_return<S>(&mut self, state: &S)
    where
        S: ExecutionState + ?Sized,
    {
        let context = state.context();
        let space = state.address_space();
        let pc = state.pc();

        let _span = tracing::trace_span! {
            "on_return",
            context = %context,
            space = %space,
            pc = %Hex(pc),
        }
        .entered();

        let Some(stack_pointer) = state.stack_pointer() else {
            tracing::warn! {
                pc = %Hex(pc),
                space = %space,
                "function return with symbolic stack pointer"
            };
            return;
        };

        let Some(pending) = self.take_pending(stack_pointer, context, space) else {
            tracing::trace!(sp = %Hex(stack_pointer), "return matches no pending call");
            return;
        };

        let event = ReturnEvent {
            context,
            space,
            pc,
            stack_pointer,
            call: pending.call,
        };
        pending.signal.emit(&event);
    }

    /// Drops every pending return owned by `context` without firing it.
    ///
    /// Engines call this when an execution context is terminated, since its calls will never
    /// return. Returns the number of entries reclaimed.
    pub fn on_context_destroyed(&mut self, context: ContextId) -> usize {
        let mut reclaimed = 0;
        self.returns.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|pending| pending.call.context != context);
            reclaimed += before - entries.len();
            !entries.is_empty()
        });
        self.pending -= reclaimed;
        if reclaimed > 0 {
            tracing::debug!(context = %context, reclaimed = reclaimed, "reclaimed pending returns");
        }
        reclaimed
    }

    /// Returns the number of calls waiting for their return.
    pub fn pending_returns(&self) -> usize {
        self.pending
    }

    /// Returns the number of registered call observers.
    pub fn call_observers(&self) -> usize {
        self.call_sites.len()
    }

    fn take_pending(
        &mut self,
        stack_pointer: u64,
        context: ContextId,
        space: AddressSpace,
    ) -> Option<PendingReturn> {
        let entries = self.returns.get_mut(&stack_pointer)?;
        let index = entries
            .iter()
            .position(|pending| pending.matches(context, space))?;
        let pending = entries.remove(index);
        if entries.is_empty() {
            self.returns.remove(&stack_pointer);
        }
        self.pending -= 1;
        Some(pending)
    }
}

impl std::fmt::Debug for FunctionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionMonitor")
            .field("call_observers", &self.call_sites.len())
            .field("pending_returns", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Snapshot;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    fn state(context: u32, space: u64, sp: Option<u64>) -> Snapshot {
        Snapshot::new(ContextId(context), AddressSpace(space), 0x400000, sp)
    }

    /// Registers a catch-all observer that attaches a return observer to every call and counts
    /// how many returns fired.
    fn count_returns(monitor: &mut FunctionMonitor) -> Rc<Cell<usize>> {
        let returned = Rc::new(Cell::new(0));
        let counter = Rc::clone(&returned);
        monitor.register_call_observer(
            ANY_TARGET,
            AddressSpace::ANY,
            move |_: &CallEvent, returns: &mut ReturnSignal| {
                let counter = Rc::clone(&counter);
                returns.connect(move |_| counter.set(counter.get() + 1));
            },
        );
        returned
    }

    #[test]
    fn test_symbolic_stack_pointer_is_dropped() {
        let mut monitor = FunctionMonitor::new();
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        monitor.register_call_observer(
            ANY_TARGET,
            AddressSpace::ANY,
            move |_: &CallEvent, returns: &mut ReturnSignal| {
                flag.set(true);
                returns.connect(|_| {});
            },
        );

        monitor.on_call(&state(1, 1, None), 0x1000);
        assert!(!fired.get());
        assert_eq!(monitor.pending_returns(), 0);
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn logs<F: FnOnce()>(f: F) -> String {
            let captured = Captured::default();
            let writer = captured.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::WARN)
                .with_writer(move || writer.clone())
                .finish();
            tracing::subscriber::with_default(subscriber, f);
            let bytes = captured.0.lock().unwrap().clone();
            String::from_utf8(bytes).unwrap()
        }
    }

    #[test]
    fn test_symbolic_stack_pointer_warning_names_pc_and_space() {
        let mut monitor = FunctionMonitor::new();
        count_returns(&mut monitor);

        let call = Snapshot::new(ContextId(1), AddressSpace(0x2000), 0x401234, None);
        let logs = Captured::logs(|| monitor.on_call(&call, 0x1000));
        assert!(logs.contains("WARN"), "{logs}");
        assert!(logs.contains("function call with symbolic stack pointer"), "{logs}");
        assert!(logs.contains("pc=0x401234"), "{logs}");
        assert!(logs.contains("space=0x2000"), "{logs}");

        let ret = Snapshot::new(ContextId(1), AddressSpace(0x2000), 0x401300, None);
        let logs = Captured::logs(|| monitor.on_return(&ret));
        assert!(logs.contains("function return with symbolic stack pointer"), "{logs}");
        assert!(logs.contains("pc=0x401300"), "{logs}");
        assert!(logs.contains("space=0x2000"), "{logs}");
        assert_eq!(monitor.pending_returns(), 0);
    }

    #[test]
    fn test_symbolic_return_leaves_pending() {
        let mut monitor = FunctionMonitor::new();
        let returned = count_returns(&mut monitor);

        monitor.on_call(&state(1, 1, Some(0x7000)), 0x1000);
        monitor.on_return(&state(1, 1, None));
        assert_eq!(returned.get(), 0);
        assert_eq!(monitor.pending_returns(), 1);

        monitor.on_return(&state(1, 1, Some(0x7000)));
        assert_eq!(returned.get(), 1);
        assert_eq!(monitor.pending_returns(), 0);
    }

    #[test]
    fn test_oldest_pending_resolves_first() {
        let mut monitor = FunctionMonitor::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&order);
        monitor.register_call_observer(
            ANY_TARGET,
            AddressSpace::ANY,
            move |call: &CallEvent, returns: &mut ReturnSignal| {
                let log = Rc::clone(&log);
                let target = call.target;
                returns.connect(move |_| log.borrow_mut().push(target));
            },
        );

        // Two calls that never returned normally leave entries with the same stack pointer.
        monitor.on_call(&state(1, 1, Some(0x7000)), 0xa);
        monitor.on_call(&state(1, 1, Some(0x7000)), 0xb);
        assert_eq!(monitor.pending_returns(), 2);

        monitor.on_return(&state(1, 1, Some(0x7000)));
        assert_eq!(*order.borrow(), vec![0xa]);
        assert_eq!(monitor.pending_returns(), 1);

        monitor.on_return(&state(1, 1, Some(0x7000)));
        assert_eq!(*order.borrow(), vec![0xa, 0xb]);
        assert_eq!(monitor.pending_returns(), 0);
    }

    #[test]
    fn test_return_event_carries_call() {
        let mut monitor = FunctionMonitor::new();
        let seen = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&seen);
        monitor.register_call_observer(
            0x1000,
            AddressSpace(3),
            move |_: &CallEvent, returns: &mut ReturnSignal| {
                let slot = Rc::clone(&slot);
                returns.connect(move |ret| *slot.borrow_mut() = Some(*ret));
            },
        );

        let call_state = Snapshot::new(ContextId(9), AddressSpace(3), 0x400010, Some(0x6ff8));
        monitor.on_call(&call_state, 0x1000);
        let ret_state = Snapshot::new(ContextId(9), AddressSpace(3), 0x1040, Some(0x6ff8));
        monitor.on_return(&ret_state);

        let ret = seen.take().expect("return should have fired");
        assert_eq!(ret.pc, 0x1040);
        assert_eq!(ret.call.pc, 0x400010);
        assert_eq!(ret.call.target, 0x1000);
        assert_eq!(ret.call.context, ContextId(9));
    }

    #[test]
    fn test_unregister_unknown() {
        let mut monitor = FunctionMonitor::new();
        let sub = monitor.register_call_observer(
            0x10,
            AddressSpace::ANY,
            |_: &CallEvent, _: &mut ReturnSignal| {},
        );
        assert_eq!(monitor.call_observers(), 1);
        assert_eq!(monitor.unregister(sub), Ok(()));
        assert_eq!(monitor.call_observers(), 0);
        assert_eq!(
            monitor.unregister(sub),
            Err(MonitorError::UnknownSubscription(sub))
        );
    }

    #[test]
    fn test_call_to_address_zero_fires_catch_all_once() {
        let mut monitor = FunctionMonitor::new();
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        monitor.register_call_observer(
            ANY_TARGET,
            AddressSpace::ANY,
            move |_: &CallEvent, _: &mut ReturnSignal| counter.set(counter.get() + 1),
        );
        monitor.on_call(&state(1, 1, Some(0x7000)), 0);
        assert_eq!(calls.get(), 1);
    }
}
