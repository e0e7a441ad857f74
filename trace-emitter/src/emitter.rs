use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use exectrace::record::{EmitError, Fork, ModuleLoad, ModuleUnload, Record, TestCase};
use function_monitor::monitor::ANY_TARGET;
use function_monitor::{
    AddressSpace, CallEvent, CallObserver, ContextId, FunctionMonitor, ReturnSignal, Subscription,
};

use crate::log::Hex;
use crate::tracefile::TraceFile;
use crate::EmitterError;

/// Writes records for the events of one traced execution.
///
/// The trace file is shared with every [`CallRecorder`] handed out by the emitter, so records
/// from observers and from direct calls end up interleaved in the order they happened.
pub struct TraceEmitter<W: Write> {
    trace: Rc<RefCell<TraceFile<W>>>,
}

impl<W: Write + 'static> TraceEmitter<W> {
    pub fn new(trace: TraceFile<W>) -> Self {
        Self {
            trace: Rc::new(RefCell::new(trace)),
        }
    }

    /// Returns a call observer that writes to this emitter's trace.
    pub fn recorder(&self) -> CallRecorder<W> {
        CallRecorder {
            trace: Rc::clone(&self.trace),
        }
    }

    /// Records every call `monitor` dispatches in `space`, together with its return.
    pub fn attach(&self, monitor: &mut FunctionMonitor, space: AddressSpace) -> Subscription {
        monitor.register_call_observer(ANY_TARGET, space, self.recorder())
    }

    /// Writes an arbitrary record.
    pub fn write<'r, R>(
        &self,
        context: ContextId,
        space: AddressSpace,
        record: R,
    ) -> Result<(), EmitError>
    where
        R: Into<Record<'r>>,
    {
        self.trace.borrow_mut().write(context, space, record)
    }

    pub fn module_load(
        &self,
        context: ContextId,
        space: AddressSpace,
        module: ModuleLoad,
    ) -> Result<(), EmitError> {
        tracing::debug! {
            name = module.name(),
            base = %Hex(module.load_base()),
            size = module.size(),
            "module loaded"
        };
        self.write(context, space, module)
    }

    pub fn module_unload(
        &self,
        context: ContextId,
        space: AddressSpace,
        load_base: u64,
    ) -> Result<(), EmitError> {
        self.write(context, space, ModuleUnload::new(load_base))
    }

    pub fn process_unload(&self, context: ContextId, space: AddressSpace) -> Result<(), EmitError> {
        self.write(context, space, Record::ProcessUnload)
    }

    /// Records that `context` forked into `children` at `pc`.
    pub fn fork(
        &self,
        context: ContextId,
        space: AddressSpace,
        pc: u64,
        children: &[ContextId],
    ) -> Result<(), EmitError> {
        let children = children.iter().map(|child| child.0).collect();
        self.write(context, space, Fork::new(pc, children))
    }

    /// Records the concrete inputs that drive `context` down its path.
    pub fn test_case(
        &self,
        context: ContextId,
        space: AddressSpace,
        case: TestCase<'_>,
    ) -> Result<(), EmitError> {
        self.write(context, space, case)
    }

    /// Returns the number of records written so far.
    pub fn written(&self) -> u64 {
        self.trace.borrow().written()
    }

    /// Flushes the trace, reporting the first write failure since the last flush.
    pub fn finish(&self) -> Result<(), EmitterError> {
        self.trace.borrow_mut().finish()
    }

    /// Flushes the trace and returns the underlying writer.
    ///
    /// Fails if a [`CallRecorder`] is still alive, for instance because it is registered with a
    /// monitor that has not been dropped.
    pub fn into_inner(self) -> Result<W, EmitterError> {
        match Rc::try_unwrap(self.trace) {
            Ok(trace) => trace.into_inner().into_inner(),
            Err(trace) => Err(EmitterError::StillShared(Rc::strong_count(&trace) - 1)),
        }
    }
}

impl<W: Write> std::fmt::Debug for TraceEmitter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEmitter")
            .field("recorders", &(Rc::strong_count(&self.trace) - 1))
            .finish()
    }
}

/// Call observer that writes a `Call` record for every call and a `Return` record when it
/// returns.
pub struct CallRecorder<W: Write> {
    trace: Rc<RefCell<TraceFile<W>>>,
}

impl<W: Write + 'static> CallObserver for CallRecorder<W> {
    fn on_call(&mut self, call: &CallEvent, returns: &mut ReturnSignal) {
        let record = exectrace::record::Call::new(call.pc, call.target);
        if let Err(err) = self.trace.borrow_mut().write(call.context, call.space, record) {
            tracing::error!(error = %err, pc = %Hex(call.pc), "failed to record call");
            return;
        }

        let trace = Rc::clone(&self.trace);
        returns.connect(move |ret| {
            let record = exectrace::record::Return::new(ret.pc, ret.call.pc);
            if let Err(err) = trace.borrow_mut().write(ret.context, ret.space, record) {
                tracing::error!(error = %err, pc = %Hex(ret.pc), "failed to record return");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exectrace::record::{ConcreteInput, RecordKind};
    use exectrace::TraceBuffer;
    use function_monitor::Snapshot;

    fn clock() -> u64 {
        0
    }

    fn kinds(bytes: &[u8]) -> Vec<RecordKind> {
        TraceBuffer::new(bytes)
            .iter()
            .map(|raw| raw.kind().unwrap())
            .collect()
    }

    #[test]
    fn test_still_shared() {
        let emitter = TraceEmitter::new(TraceFile::with_clock(Vec::new(), clock));
        let mut monitor = FunctionMonitor::new();
        emitter.attach(&mut monitor, AddressSpace::ANY);

        let err = emitter.into_inner().unwrap_err();
        assert!(matches!(err, EmitterError::StillShared(1)));
    }

    #[test]
    fn test_direct_records() {
        let emitter = TraceEmitter::new(TraceFile::with_clock(Vec::new(), clock));
        let (ctx, space) = (ContextId(1), AddressSpace(0x10));
        emitter
            .module_load(ctx, space, ModuleLoad::new("libc.so.6", 0x7f00, 0x1000, 0x2000))
            .unwrap();
        emitter.fork(ctx, space, 0x401000, &[ContextId(2), ContextId(3)]).unwrap();
        emitter
            .test_case(
                ctx,
                space,
                TestCase::new(vec![ConcreteInput::new(b"stdin".as_slice(), b"AAAA".as_slice())]),
            )
            .unwrap();
        emitter.module_unload(ctx, space, 0x7f00).unwrap();
        emitter.process_unload(ctx, space).unwrap();
        assert_eq!(emitter.written(), 5);

        let bytes = emitter.into_inner().unwrap();
        assert_eq!(
            kinds(&bytes),
            vec![
                RecordKind::ModuleLoad,
                RecordKind::Fork,
                RecordKind::TestCase,
                RecordKind::ModuleUnload,
                RecordKind::ProcessUnload,
            ]
        );
    }

    #[test]
    fn test_unencodable_record_is_not_written() {
        let emitter = TraceEmitter::new(TraceFile::with_clock(Vec::new(), clock));
        let name = "a".repeat(64);
        let err = emitter
            .module_load(ContextId(0), AddressSpace(1), ModuleLoad::new(name, 0, 0, 0))
            .unwrap_err();
        assert!(matches!(
            err.root(),
            exectrace::record::Error::TooLarge { .. }
        ));
        assert_eq!(emitter.written(), 0);
        assert!(emitter.into_inner().unwrap().is_empty());
    }

    #[test]
    fn test_recorder_respects_space() {
        let emitter = TraceEmitter::new(TraceFile::with_clock(Vec::new(), clock));
        let mut monitor = FunctionMonitor::new();
        emitter.attach(&mut monitor, AddressSpace(2));

        let other = Snapshot::new(ContextId(0), AddressSpace(3), 0x10, Some(0x8000));
        monitor.on_call(&other, 0x100);
        let traced = Snapshot::new(ContextId(0), AddressSpace(2), 0x10, Some(0x8000));
        monitor.on_call(&traced, 0x100);
        drop(monitor);

        let bytes = emitter.into_inner().unwrap();
        assert_eq!(kinds(&bytes), vec![RecordKind::Call]);
    }
}
