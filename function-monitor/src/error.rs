use crate::registry::Subscription;

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("no call observer is registered for {0:?}")]
    UnknownSubscription(Subscription),
}
