//! Processing engine: retry/dead-letter policy, concurrent dispatcher, lock
//! renewal supervision, in-flight accounting and the processor lifecycle.

pub mod dispatcher;
pub mod in_flight;
pub mod lifecycle;
pub mod policy;
pub mod renewal;

pub use dispatcher::{
    DispatchSettings, Dispatcher, DispatcherParams, ErrorHandler, LogErrors, SourceErrorEvent,
    SourceOperation,
};
pub use in_flight::{InFlightGuard, InFlightTracker};
pub use lifecycle::{Processor, ProcessorError, ProcessorState, StopReport};
pub use policy::{decide, Disposition, RetryPolicy, MAX_DELIVERY_COUNT_EXCEEDED};
pub use renewal::{RenewalExit, RenewalHandle, RenewalSupervisor};
