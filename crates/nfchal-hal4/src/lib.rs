//! HAL4 session manager for an NCI NFC controller.
//!
//! [`Hal4`] sits between an upper NFC stack and the controller transport.
//! It owns the controller lifecycle, the discovery wheel, the remote device
//! list, one connection at a time and the secure-element modes. Requests
//! are synchronous calls that hand in a [`Completion`]; transport events
//! and timer expiries are fed back in by the owner. [`Hal4Service`] runs
//! the whole thing on a tokio worker.

pub mod config;
pub mod context;
pub mod discovery;
pub mod fsm;
pub mod notification;
pub mod secure_element;
pub mod service;
pub mod session;
pub mod transceive;

pub use config::Hal4Config;
pub use context::Completion;
pub use discovery::{Candidate, DiscoveryConfig, resolve_candidates};
pub use fsm::{ControllerFsm, ControllerState, StateTransition};
pub use notification::{
    DefaultEvent, DiscoveryNotification, Listener, P2pNotification, SecureElementEvent,
};
pub use secure_element::{ConfigParameters, EmulationConfig, routing_priority};
pub use service::{Hal4Handle, Hal4Service, Pending, TokioTimers, TransportEventSink, WorkerMessage};
pub use session::Hal4;
pub use transceive::{MemoryCommand, TransceiveRequest, TransceiveResponse, TransceiveStatus};
