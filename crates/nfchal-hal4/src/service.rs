//! Tokio service wrapper.
//!
//! [`Hal4`] is synchronous. The service moves it onto a worker task that
//! serializes requests, transport events and timer expiries:
//!
//! ```text
//! ┌────────────┐  requests  ┌──────────────┐
//! │ Hal4Handle │───────────►│              │
//! └────────────┘            │   worker     │
//! ┌────────────┐  events    │  (owns Hal4) │
//! │ transport  │───────────►│              │
//! └────────────┘            │              │
//! ┌────────────┐  expiries  │              │
//! │ TokioTimers│───────────►│              │
//! └────────────┘            └──────────────┘
//! ```
//!
//! Deferred calls are drained after every message.
//!
//! # Examples
//!
//! ```no_run
//! use nfchal_core::InitType;
//! use nfchal_hal4::{Hal4Config, Hal4Service};
//! use nfchal_transport::mock::MockTransport;
//!
//! # async fn example() -> nfchal_core::Result<()> {
//! let service = Hal4Service::spawn(Hal4Config::default(), |_sink| MockTransport::new().0)?;
//! let handle = service.handle();
//! handle.open(InitType::Normal).await?;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use nfchal_core::{
    Capabilities, CloseMode, ContextId, DeviceHandle, DiscoveryMode, DiscoveryRequest, HalError,
    InitType, ListenerKind, ReleaseType, RemoteDevice, Result, SmxMode, SwpMode,
};
use nfchal_transport::{TimerId, TimerService, Transport, TransportEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Hal4Config;
use crate::context::Completion;
use crate::notification::Listener;
use crate::secure_element::ConfigParameters;
use crate::session::Hal4;
use crate::transceive::{TransceiveRequest, TransceiveResponse};

/// Input of the worker other than requests.
#[derive(Debug)]
pub enum WorkerMessage {
    Transport(TransportEvent),
    TimerExpired { owner: ContextId, timer: TimerId },
}

/// Where a transport implementation posts its events.
#[derive(Debug, Clone)]
pub struct TransportEventSink {
    tx: mpsc::Sender<WorkerMessage>,
}

impl TransportEventSink {
    /// Post an event, waiting for inbox space.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Shutdown`] once the worker has stopped.
    pub async fn post(&self, event: TransportEvent) -> Result<()> {
        self.tx
            .send(WorkerMessage::Transport(event))
            .await
            .map_err(|_| HalError::Shutdown)
    }

    /// Post an event from synchronous code.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Busy`] when the inbox is full and
    /// [`HalError::Shutdown`] once the worker has stopped.
    pub fn try_post(&self, event: TransportEvent) -> Result<()> {
        self.tx
            .try_send(WorkerMessage::Transport(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HalError::Busy,
                mpsc::error::TrySendError::Closed(_) => HalError::Shutdown,
            })
    }
}

/// [`TimerService`] backed by `tokio::time::sleep` tasks.
///
/// Expiry is posted to the worker inbox. Stopping a timer aborts its task.
#[derive(Debug)]
pub struct TokioTimers {
    tx: mpsc::Sender<WorkerMessage>,
    next_id: u64,
    armed: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioTimers {
    pub fn new(sink: &TransportEventSink) -> Self {
        Self {
            tx: sink.tx.clone(),
            next_id: 0,
            armed: HashMap::new(),
        }
    }

    /// Number of timers not yet fired or stopped.
    pub fn armed(&self) -> usize {
        self.armed.values().filter(|task| !task.is_finished()).count()
    }
}

impl TimerService for TokioTimers {
    fn start(&mut self, owner: ContextId, timeout: Duration) -> TimerId {
        self.armed.retain(|_, task| !task.is_finished());
        self.next_id += 1;
        let timer = TimerId::new(self.next_id);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if tx.send(WorkerMessage::TimerExpired { owner, timer }).await.is_err() {
                debug!(%timer, "timer fired after worker shutdown");
            }
        });
        self.armed.insert(timer, task);
        timer
    }

    fn stop(&mut self, id: TimerId) {
        if let Some(task) = self.armed.remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for task in self.armed.values() {
            task.abort();
        }
    }
}

type Job<T> = Box<dyn FnOnce(&mut Hal4<T, TokioTimers>) + Send>;

enum Request<T> {
    Run(Job<T>),
    Shutdown,
}

/// The completion of a request the worker has accepted.
#[derive(Debug)]
pub struct Pending<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Pending<R> {
    /// Wait for the result.
    ///
    /// A completion dropped without an answer reads as
    /// [`HalError::Shutdown`].
    pub async fn wait(self) -> Result<R> {
        self.rx.await.unwrap_or(Err(HalError::Shutdown))
    }
}

/// Cloneable request side of a running [`Hal4Service`].
pub struct Hal4Handle<T> {
    tx: mpsc::Sender<Request<T>>,
}

impl<T> Clone for Hal4Handle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Hal4Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hal4Handle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T: Transport + Send + 'static> Hal4Handle<T> {
    /// Run a synchronous call on the worker.
    async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Hal4<T, TokioTimers>) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<T> = Box::new(move |hal| {
            let _ = tx.send(f(hal));
        });
        self.tx
            .send(Request::Run(job))
            .await
            .map_err(|_| HalError::Shutdown)?;
        rx.await.unwrap_or(Err(HalError::Shutdown))
    }

    /// Submit an asynchronous request.
    ///
    /// Resolves once the worker has accepted or rejected it. The returned
    /// [`Pending`] yields the completion.
    pub async fn submit<R, F>(&self, f: F) -> Result<Pending<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut Hal4<T, TokioTimers>, Completion<R>) -> Result<()> + Send + 'static,
    {
        let (completion, rx) = oneshot::channel();
        self.call(move |hal| f(hal, completion)).await?;
        Ok(Pending { rx })
    }

    async fn request<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Hal4<T, TokioTimers>, Completion<R>) -> Result<()> + Send + 'static,
    {
        self.submit(f).await?.wait().await
    }

    pub async fn open(&self, init_type: InitType) -> Result<()> {
        self.request(move |hal, done| hal.open(init_type, done)).await
    }

    pub async fn close(&self, mode: CloseMode) -> Result<()> {
        self.request(move |hal, done| hal.close(mode, done)).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.call(|hal| {
            hal.reset();
            Ok(())
        })
        .await
    }

    pub async fn capabilities(&self) -> Result<Capabilities> {
        self.call(|hal| hal.capabilities()).await
    }

    pub async fn register_listener(&self, listener: Listener) -> Result<()> {
        self.call(move |hal| hal.register_listener(listener)).await
    }

    pub async fn unregister_listener(&self, kind: ListenerKind) -> Result<()> {
        self.call(move |hal| hal.unregister_listener(kind)).await
    }

    pub async fn configure_parameters(&self, params: ConfigParameters) -> Result<()> {
        self.request(move |hal, done| hal.configure_parameters(params, done))
            .await
    }

    pub async fn configure_discovery(&self, mode: DiscoveryMode, request: DiscoveryRequest) -> Result<()> {
        self.request(move |hal, done| hal.configure_discovery(mode, request, done))
            .await
    }

    pub async fn connect(&self, handle: DeviceHandle) -> Result<RemoteDevice> {
        self.request(move |hal, done| hal.connect(handle, done)).await
    }

    pub async fn transceive(
        &self,
        handle: DeviceHandle,
        request: TransceiveRequest,
    ) -> Result<TransceiveResponse> {
        self.request(move |hal, done| hal.transceive(handle, request, done))
            .await
    }

    pub async fn send(&self, handle: DeviceHandle, data: Vec<u8>) -> Result<()> {
        self.request(move |hal, done| hal.send(handle, data, done)).await
    }

    pub async fn receive(&self, handle: DeviceHandle) -> Result<Vec<u8>> {
        self.request(move |hal, done| hal.receive(handle, done)).await
    }

    pub async fn disconnect(&self, handle: DeviceHandle, release: ReleaseType) -> Result<()> {
        self.request(move |hal, done| hal.disconnect(handle, release, done))
            .await
    }

    pub async fn presence_check(&self) -> Result<()> {
        self.request(|hal, done| hal.presence_check(done)).await
    }

    pub async fn switch_smx_mode(&self, mode: SmxMode) -> Result<()> {
        self.request(move |hal, done| hal.switch_smx_mode(mode, done)).await
    }

    pub async fn switch_swp_mode(&self, mode: SwpMode) -> Result<()> {
        self.request(move |hal, done| hal.switch_swp_mode(mode, done)).await
    }
}

/// A running worker.
pub struct Hal4Service<T> {
    handle: Hal4Handle<T>,
    task: JoinHandle<()>,
}

impl<T: Transport + Send + 'static> Hal4Service<T> {
    /// Build the transport and start the worker.
    ///
    /// `factory` receives the sink the transport posts its events to.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Config`] if `config` is out of range.
    pub fn spawn<F>(config: Hal4Config, factory: F) -> Result<Self>
    where
        F: FnOnce(TransportEventSink) -> T,
    {
        config.validate()?;
        let capacity = config.worker_queue_capacity;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (request_tx, request_rx) = mpsc::channel(capacity);

        let sink = TransportEventSink { tx: event_tx };
        let timers = TokioTimers::new(&sink);
        let transport = factory(sink);
        let hal = Hal4::with_config(config, transport, timers)?;

        let task = tokio::spawn(run_worker(hal, event_rx, request_rx));
        info!(capacity, "hal4 worker started");
        Ok(Self {
            handle: Hal4Handle { tx: request_tx },
            task,
        })
    }

    pub fn handle(&self) -> Hal4Handle<T> {
        self.handle.clone()
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// The controller is reset; outstanding completions read as
    /// [`HalError::Shutdown`].
    pub async fn shutdown(self) {
        if self.handle.tx.send(Request::Shutdown).await.is_err() {
            debug!("worker already stopped");
        }
        if let Err(error) = self.task.await {
            warn!(%error, "hal4 worker ended abnormally");
        }
    }
}

async fn run_worker<T: Transport>(
    mut hal: Hal4<T, TokioTimers>,
    mut events: mpsc::Receiver<WorkerMessage>,
    mut requests: mpsc::Receiver<Request<T>>,
) {
    loop {
        tokio::select! {
            Some(message) = events.recv() => match message {
                WorkerMessage::Transport(event) => hal.handle_transport_event(event),
                WorkerMessage::TimerExpired { owner, timer } => hal.handle_timer_expired(owner, timer),
            },
            request = requests.recv() => match request {
                Some(Request::Run(job)) => job(&mut hal),
                Some(Request::Shutdown) | None => break,
            },
        }
        hal.run_deferred();
    }
    hal.reset();
    info!("hal4 worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_posts_expiry() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = TransportEventSink { tx };
        let mut timers = TokioTimers::new(&sink);

        let id = timers.start(ContextId::new(7), Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(60)).await;

        match rx.recv().await {
            Some(WorkerMessage::TimerExpired { owner, timer }) => {
                assert_eq!(owner, ContextId::new(7));
                assert_eq!(timer, id);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_fires() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = TransportEventSink { tx };
        let mut timers = TokioTimers::new(&sink);

        let id = timers.start(ContextId::new(1), Duration::from_millis(50));
        timers.stop(id);
        tokio::time::advance(Duration::from_millis(100)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(timers.armed(), 0);
    }

    #[tokio::test]
    async fn test_try_post_on_full_inbox() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = TransportEventSink { tx };
        sink.try_post(TransportEvent::CloseComplete).unwrap();
        assert_eq!(sink.try_post(TransportEvent::CloseComplete), Err(HalError::Busy));
    }

    #[tokio::test]
    async fn test_post_after_worker_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = TransportEventSink { tx };
        assert_eq!(sink.post(TransportEvent::CloseComplete).await, Err(HalError::Shutdown));
    }
}
