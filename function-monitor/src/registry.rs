use hashbrown::HashMap;

use crate::signal::{CallEvent, ReturnSignal};
use crate::AddressSpace;

/// Something that wants to hear about calls.
///
/// `returns` is a fresh signal for this observer and this call only. Connecting to it requests a
/// notification when the call returns.
pub trait CallObserver {
    fn on_call(&mut self, call: &CallEvent, returns: &mut ReturnSignal);
}

impl<F> CallObserver for F
where
    F: FnMut(&CallEvent, &mut ReturnSignal),
{
    fn on_call(&mut self, call: &CallEvent, returns: &mut ReturnSignal) {
        self(call, returns)
    }
}

/// Handle identifying one call observer registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    target: u64,
    space: AddressSpace,
}

impl Subscription {
    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }
}

struct Registration {
    id: u64,
    space: AddressSpace,
    observer: Box<dyn CallObserver>,
}

/// Call observers keyed by target address.
///
/// Several registrations may share the same target and address space. Within a target they are
/// kept in registration order, which is also the order they are fired in.
#[derive(Default)]
pub struct CallSites {
    sites: HashMap<u64, Vec<Registration>>,
    next_id: u64,
    len: usize,
}

impl CallSites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        target: u64,
        space: AddressSpace,
        observer: Box<dyn CallObserver>,
    ) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.sites.entry(target).or_default().push(Registration {
            id,
            space,
            observer,
        });
        self.len += 1;
        Subscription { id, target, space }
    }

    /// Removes a registration. Returns false if it was not registered.
    pub fn unregister(&mut self, subscription: Subscription) -> bool {
        let Some(registrations) = self.sites.get_mut(&subscription.target) else {
            return false;
        };
        let Some(index) = registrations.iter().position(|r| r.id == subscription.id) else {
            return false;
        };
        registrations.remove(index);
        if registrations.is_empty() {
            self.sites.remove(&subscription.target);
        }
        self.len -= 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fires every observer registered under `target` whose address space matches the call.
    ///
    /// Return observers attached by the fired observers are appended to `returns`. Returns the
    /// number of observers that fired.
    pub(crate) fn dispatch(
        &mut self,
        target: u64,
        call: &CallEvent,
        returns: &mut ReturnSignal,
    ) -> usize {
        let Some(registrations) = self.sites.get_mut(&target) else {
            return 0;
        };
        let mut fired = 0;
        for registration in registrations
            .iter_mut()
            .filter(|r| r.space.matches(call.space))
        {
            let mut signal = ReturnSignal::new();
            registration.observer.on_call(call, &mut signal);
            returns.append(signal);
            fired += 1;
        }
        fired
    }
}
