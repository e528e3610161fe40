//! Upper-layer notification channels.
//!
//! Completions answer one request. Notifications are unsolicited and go to
//! whichever listener of the matching [`ListenerKind`] is registered. At
//! most one listener of each kind is registered at a time.

use nfchal_core::{
    DeviceHandle, DiscoveryStatus, HalError, ListenerKind, RemoteDevice, Result, RfTechnology,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// Tag discovery channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryNotification {
    /// A round finished with one or more candidates.
    Discovered {
        status: DiscoveryStatus,
        devices: Vec<RemoteDevice>,
    },
    /// A round was aborted.
    Failed(HalError),
}

/// P2P discovery channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum P2pNotification {
    Discovered(RemoteDevice),
    Failed(HalError),
    /// The peer left the field.
    Deactivated(DeviceHandle),
}

/// Secure-element channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecureElementEvent {
    /// An external reader activated card emulation.
    Activated { technology: RfTechnology },
    /// The external reader left.
    Deactivated,
    /// An external reader selected an application on an NFCEE.
    Transaction {
        nfcee_id: u8,
        aid: Vec<u8>,
        data: Vec<u8>,
    },
    FieldChanged { nfcee_id: u8, on: bool },
}

/// Default channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultEvent {
    /// The connected device left the field.
    TargetLost(DeviceHandle),
    /// The controller raised an error outside any request.
    ControllerError(HalError),
}

/// A listener to register, one variant per channel.
///
/// ```
/// use nfchal_core::ListenerKind;
/// use nfchal_hal4::Listener;
/// use tokio::sync::mpsc;
///
/// let (tx, _rx) = mpsc::unbounded_channel();
/// assert_eq!(Listener::TagDiscovery(tx).kind(), ListenerKind::TagDiscovery);
/// ```
#[derive(Debug, Clone)]
pub enum Listener {
    TagDiscovery(UnboundedSender<DiscoveryNotification>),
    P2pDiscovery(UnboundedSender<P2pNotification>),
    SecureElement(UnboundedSender<SecureElementEvent>),
    Default(UnboundedSender<DefaultEvent>),
}

impl Listener {
    pub fn kind(&self) -> ListenerKind {
        match self {
            Self::TagDiscovery(_) => ListenerKind::TagDiscovery,
            Self::P2pDiscovery(_) => ListenerKind::P2pDiscovery,
            Self::SecureElement(_) => ListenerKind::SecureElement,
            Self::Default(_) => ListenerKind::Default,
        }
    }
}

fn deliver<T>(slot: &Option<UnboundedSender<T>>, kind: ListenerKind, message: T) -> bool {
    match slot {
        Some(tx) => {
            if tx.send(message).is_err() {
                warn!(listener = %kind, "listener dropped its receiver");
                return false;
            }
            true
        }
        None => false,
    }
}

/// Registered listeners of one controller context.
#[derive(Debug, Default)]
pub(crate) struct Listeners {
    tag: Option<UnboundedSender<DiscoveryNotification>>,
    p2p: Option<UnboundedSender<P2pNotification>>,
    secure_element: Option<UnboundedSender<SecureElementEvent>>,
    default: Option<UnboundedSender<DefaultEvent>>,
}

impl Listeners {
    pub fn register(&mut self, listener: Listener) -> Result<()> {
        let kind = listener.kind();
        if self.is_registered(kind) {
            return Err(HalError::AlreadyRegistered(kind.to_string()));
        }
        match listener {
            Listener::TagDiscovery(tx) => self.tag = Some(tx),
            Listener::P2pDiscovery(tx) => self.p2p = Some(tx),
            Listener::SecureElement(tx) => self.secure_element = Some(tx),
            Listener::Default(tx) => self.default = Some(tx),
        }
        Ok(())
    }

    pub fn unregister(&mut self, kind: ListenerKind) -> Result<()> {
        let removed = match kind {
            ListenerKind::TagDiscovery => self.tag.take().is_some(),
            ListenerKind::P2pDiscovery => self.p2p.take().is_some(),
            ListenerKind::SecureElement => self.secure_element.take().is_some(),
            ListenerKind::Default => self.default.take().is_some(),
        };
        if removed {
            Ok(())
        } else {
            Err(HalError::NotRegistered(kind.to_string()))
        }
    }

    pub fn is_registered(&self, kind: ListenerKind) -> bool {
        match kind {
            ListenerKind::TagDiscovery => self.tag.is_some(),
            ListenerKind::P2pDiscovery => self.p2p.is_some(),
            ListenerKind::SecureElement => self.secure_element.is_some(),
            ListenerKind::Default => self.default.is_some(),
        }
    }

    pub fn notify_tag(&self, notification: DiscoveryNotification) -> bool {
        deliver(&self.tag, ListenerKind::TagDiscovery, notification)
    }

    pub fn notify_p2p(&self, notification: P2pNotification) -> bool {
        deliver(&self.p2p, ListenerKind::P2pDiscovery, notification)
    }

    pub fn notify_secure_element(&self, event: SecureElementEvent) -> bool {
        deliver(&self.secure_element, ListenerKind::SecureElement, event)
    }

    pub fn notify_default(&self, event: DefaultEvent) -> bool {
        deliver(&self.default, ListenerKind::Default, event)
    }

    /// Report an aborted round on every registered discovery channel.
    pub fn notify_discovery_failed(&self, error: &HalError) {
        self.notify_tag(DiscoveryNotification::Failed(error.clone()));
        self.notify_p2p(P2pNotification::Failed(error.clone()));
    }
}
