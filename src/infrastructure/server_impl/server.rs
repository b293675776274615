//! Connection supervisor.
//!
//! One accept loop hands every socket to its own worker task. A worker goes
//! `Accepted -> Parsing -> Dispatching -> Responding -> Closed`; any I/O or decode
//! failure short-circuits to `Closed`. Each worker reports its completion exactly once,
//! through a drop guard, so the live registry stays consistent even when a worker is
//! aborted during shutdown.

use crate::application::assets::ByteProvider;
use crate::application::dispatcher::Dispatcher;
use crate::application::routes::RouteTable;
use crate::domain::request::{Request, RequestId};
use crate::domain::route::Route;
use crate::infrastructure::config::ServerConfig;
use crate::infrastructure::server_impl::request::{decode_payload, read_request, ReadLimits};
use crate::infrastructure::server_impl::response::ResponseWriter;
use crate::AnyResult;
use eyre::{eyre, WrapErr};
use fnv::FnvHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    /// A response with this status was written.
    Served(u16),
    /// Nothing to answer: the client closed early or sent a malformed request.
    Empty,
    Failed(String),
    /// Aborted by a server stop before finishing.
    Interrupted,
}

#[derive(Debug)]
pub struct Completion {
    pub id: RequestId,
    pub status: WorkerStatus,
}

#[derive(Debug)]
struct Shared {
    accepting: AtomicBool,
    workers: Mutex<FnvHashMap<RequestId, AbortHandle>>,
    stop: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl Shared {
    fn workers(&self) -> MutexGuard<'_, FnvHashMap<RequestId, AbortHandle>> {
        // a poisoned registry is still structurally sound
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn interrupt_workers(&self) {
        let workers = self.workers();
        for handle in workers.values() {
            handle.abort();
        }
        tracing::debug!(workers = workers.len(), "interrupted live workers");
    }
}

/// Cloneable control surface of a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stops accepting, interrupts live workers and lets the accept loop close the listener.
    pub fn stop(&self) {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            tracing::warn!("server already stopped");
            return;
        }
        tracing::info!("stopping server");
        self.shared.stop.send_replace(true);
        self.shared.interrupt_workers();
    }

    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.shared.workers().len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }
}

/// Everything a worker needs, shared by all of them.
#[derive(Debug)]
struct ConnectionContext {
    dispatcher: Arc<Dispatcher>,
    assets: Arc<dyn ByteProvider>,
    limits: ReadLimits,
}

/// Sends the worker's completion exactly once, defaulting to `Interrupted` when dropped
/// before [`CompletionGuard::finish`] ran.
struct CompletionGuard {
    id: RequestId,
    tx: mpsc::UnboundedSender<Completion>,
    reported: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl CompletionGuard {
    fn report(&mut self, status: WorkerStatus) {
        if self.reported {
            return;
        }
        self.reported = true;
        // the reaper is gone once the server shut down
        let _ = self.tx.send(Completion {
            id: self.id.clone(),
            status,
        });
    }

    fn finish(mut self, status: WorkerStatus) {
        self.report(status);
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.report(WorkerStatus::Interrupted);
    }
}

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    worker_limit: Option<Arc<Semaphore>>,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
}

impl Server {
    /// Binds the configured address and installs `routes` for the server's lifetime.
    pub async fn bind(
        config: &ServerConfig,
        routes: Vec<Route>,
        assets: Arc<dyn ByteProvider>,
    ) -> AnyResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_address.as_str())
            .await
            .wrap_err_with(|| format!("failed to bind {}", config.bind_address))?;
        Self::from_listener(listener, config, routes, assets)
    }

    /// Serves on a listener handed over by the host, e.g. through socket activation.
    pub fn from_std(
        listener: std::net::TcpListener,
        config: &ServerConfig,
        routes: Vec<Route>,
        assets: Arc<dyn ByteProvider>,
    ) -> AnyResult<Self> {
        listener.set_nonblocking(true)?;
        Self::from_listener(TcpListener::from_std(listener)?, config, routes, assets)
    }

    fn from_listener(
        listener: TcpListener,
        config: &ServerConfig,
        routes: Vec<Route>,
        assets: Arc<dyn ByteProvider>,
    ) -> AnyResult<Self> {
        let local_addr = listener.local_addr()?;
        let dispatcher = Dispatcher::new(RouteTable::new(routes), assets.clone(), config);
        let (stop, stop_rx) = watch::channel(false);

        tracing::info!(
            address = %local_addr,
            routes = dispatcher.routes().len(),
            max_workers = ?config.max_workers,
            "server bound"
        );

        Ok(Self {
            listener,
            context: Arc::new(ConnectionContext {
                dispatcher: Arc::new(dispatcher),
                assets,
                limits: ReadLimits {
                    max_head_bytes: config.max_head_bytes,
                    max_body_bytes: config.max_body_bytes,
                    idle_timeout: config.idle_timeout(),
                },
            }),
            worker_limit: config.max_workers.map(|max| Arc::new(Semaphore::new(max))),
            shared: Arc::new(Shared {
                accepting: AtomicBool::new(true),
                workers: Mutex::new(FnvHashMap::default()),
                stop,
                local_addr,
            }),
            stop_rx,
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Runs the accept loop on its own task.
    pub fn spawn(self) -> (ServerHandle, JoinHandle<AnyResult<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    async fn acquire_slot(limit: Option<Arc<Semaphore>>) -> AnyResult<Option<OwnedSemaphorePermit>> {
        match limit {
            Some(semaphore) => Ok(Some(semaphore.acquire_owned().await?)),
            None => Ok(None),
        }
    }

    /// Accepts connections until [`ServerHandle::stop`] is called.
    pub async fn run(mut self) -> AnyResult<()> {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let reaper = tokio::spawn(reap(done_rx, self.shared.clone()));
        tracing::info!(address = %self.shared.local_addr, "server started");

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = self.stop_rx.changed() => break,
                permit = Self::acquire_slot(self.worker_limit.clone()) => permit?,
            };

            let accepted = tokio::select! {
                _ = self.stop_rx.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_worker(stream, peer, permit, &done_tx),
                Err(err) if !self.shared.accepting.load(Ordering::SeqCst) => {
                    tracing::debug!(%err, "accept failed while stopping");
                    break;
                }
                Err(err) => tracing::error!(%err, "failed to accept connection"),
            }
        }

        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.interrupt_workers();
        drop(self.listener);
        drop(done_tx);
        // aborted workers still report through their guards
        reaper.await.wrap_err("completion reaper panicked")?;

        tracing::info!("server stopped");
        Ok(())
    }

    fn spawn_worker(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let id = RequestId::generate();
        let guard = CompletionGuard {
            id: id.clone(),
            tx: done_tx.clone(),
            reported: false,
            _permit: permit,
        };
        let context = self.context.clone();

        // registered before the worker can report, so the reaper never misses an entry
        let mut workers = self.shared.workers();
        let task = tokio::spawn(async move {
            let status = match serve_connection(stream, peer, guard.id.clone(), &context).await {
                Ok(status) => status,
                Err(err) => WorkerStatus::Failed(format!("{err:#}")),
            };
            guard.finish(status);
        });
        workers.insert(id, task.abort_handle());
    }
}

/// Removes finished workers from the registry as their completions arrive.
async fn reap(mut done_rx: mpsc::UnboundedReceiver<Completion>, shared: Arc<Shared>) {
    while let Some(Completion { id, status }) = done_rx.recv().await {
        let live = {
            let mut workers = shared.workers();
            workers.remove(&id);
            workers.len()
        };

        match &status {
            WorkerStatus::Served(code) => {
                tracing::debug!(request_id = %id, status = code, live, "request completed")
            }
            WorkerStatus::Empty => tracing::debug!(request_id = %id, live, "empty request"),
            WorkerStatus::Failed(err) => {
                tracing::warn!(request_id = %id, error = %err, live, "request failed")
            }
            WorkerStatus::Interrupted => {
                tracing::debug!(request_id = %id, live, "request interrupted")
            }
        }
    }
}

/// Parses, dispatches and answers one connection, then closes it.
async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    id: RequestId,
    context: &ConnectionContext,
) -> AnyResult<WorkerStatus> {
    let incoming = match read_request(&mut stream, Request::new(id, Some(peer)), &context.limits).await {
        Ok(incoming) => incoming,
        Err(err) if err.is_transport() => {
            let _ = stream.shutdown().await;
            return Ok(WorkerStatus::Failed(err.to_string()));
        }
        Err(err) => return Err(err.into()),
    };
    if !incoming.request.is_complete() {
        let _ = stream.shutdown().await;
        return Ok(WorkerStatus::Empty);
    }

    let dispatcher = context.dispatcher.clone();
    let mut writer = ResponseWriter::new(context.assets.clone());
    // handlers are synchronous and may block on the byte provider
    let writer = tokio::task::spawn_blocking(move || {
        let mut request = incoming.request;
        tracing::debug!(
            request_id = %request.id,
            method = ?request.method(),
            path = request.path(),
            "dispatching"
        );

        let outcome = decode_payload(&request.headers, &incoming.body)
            .map_err(eyre::Report::from)
            .and_then(|payload| {
                request.payload = payload;
                dispatcher.handle(&mut request, &mut writer)
            });
        if let Err(err) = outcome {
            dispatcher.handle_failure(&request, &mut writer, &err);
        }
        writer
    })
    .await
    .map_err(|err| eyre!("handler panicked: {err}"))?;

    let status = writer.status();
    if let Some(bytes) = writer.into_output() {
        stream.write_all(&bytes).await?;
        stream.flush().await?;
    }
    let _ = stream.shutdown().await;

    Ok(status.map_or(WorkerStatus::Empty, WorkerStatus::Served))
}
