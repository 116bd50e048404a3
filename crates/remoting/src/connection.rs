//! # Connection with Async Pump
//!
//! One `Connection` owns one transport and plays both roles on it:
//!
//! - **Caller**: mints a sequence number, marshals the arguments, registers a
//!   pending reply, sends the frame and awaits the reply or the timeout.
//! - **Owner**: the pump task reads every inbound frame. Replies are routed to
//!   their waiter by seq; calls are dispatched on their own task, so they may
//!   complete in any order; release and shutdown frames are applied inline.
//!
//! ## Failure
//!
//! A frame that cannot be parsed, or a reply that names an object this side
//! cannot resolve, is a protocol error: the channel closes, every pending call
//! fails with the error, and the instance registry is cleared.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use wirepack::Encoder;

use crate::config::Config;
use crate::error::Error;
use crate::error::Fault;
use crate::error::FaultKind;
use crate::error::Result;
use crate::frame;
use crate::frame::CallEncoder;
use crate::frame::CreateEncoder;
use crate::frame::Frame;
use crate::frame::FunctionKind;
use crate::frame::Inbound;
use crate::frame::ReplyErrEncoder;
use crate::frame::ReplyOkEncoder;
use crate::frame::WireArg;
use crate::marshal::Marshaller;
use crate::pool::BufferPool;
use crate::proxy::Proxy;
use crate::proxy::ProxyInner;
use crate::registry::InstanceRegistry;
use crate::registry::ObjectId;
use crate::registry::PendingExports;
use crate::skeleton::Args;
use crate::surrogate::SurrogateRegistry;
use crate::transport::Transport;
use crate::value::IntoArgs;
use crate::value::Value;

type PendingReply = oneshot::Sender<Result<Value>>;

pub(crate) struct ConnectionInner {
    pub(crate) config: Config,
    pub(crate) surrogates: Arc<SurrogateRegistry>,
    pub(crate) registry: InstanceRegistry,
    transport: Arc<dyn Transport>,
    pending: DashMap<u64, PendingReply>,
    seq_gen: AtomicU64,
    pool: Arc<BufferPool>,
    write_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// A call/reply channel to one peer.
///
/// Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates the connection and spawns its pump task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(transport: Box<dyn Transport>, surrogates: Arc<SurrogateRegistry>, config: Config) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(ConnectionInner {
            pool: BufferPool::new(config.buffer_pool_capacity),
            config,
            surrogates,
            registry: InstanceRegistry::new(),
            transport: Arc::from(transport),
            pending: DashMap::new(),
            seq_gen: AtomicU64::new(1),
            write_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(ConnectionInner::pump(inner.clone()));
        Self { inner }
    }

    pub fn side_name(&self) -> &str {
        &self.inner.config.side_name
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    pub fn surrogates(&self) -> &SurrogateRegistry {
        &self.inner.surrogates
    }

    /// Asks the peer to construct a registered remote type and returns a proxy to it.
    pub async fn create_instance(&self, type_name: &str, args: impl IntoArgs) -> Result<Proxy> {
        if type_name.is_empty() {
            return Err(Error::InvalidTarget("empty type name".into()));
        }
        let value = self
            .inner
            .request(&args.into_args(), |seq, enc, wire| CreateEncoder::new(seq, type_name, wire).encode(enc))
            .await?;
        value
            .proxy()
            .ok_or_else(|| Error::Protocol(format!("CreateInstance returned {:?}, not a reference", value)))
    }

    /// Invokes `method` on the peer's object `target`.
    pub async fn invoke(&self, target: &str, method: &str, args: impl IntoArgs) -> Result<Value> {
        let target = ObjectId::parse(target)?;
        self.inner.invoke(&target, method, args.into_args()).await
    }

    /// Registers a local reference-proxy object so the peer can address it by id.
    pub fn publish(&self, value: &Value) -> Result<ObjectId> {
        let Value::Instance(inst) = value else {
            return Err(Error::Serialization(format!("{} is not an object", value.type_name())));
        };
        let surrogate = self
            .inner
            .surrogates
            .by_type(std::any::Any::type_id(inst.object().as_ref()))
            .filter(|s| s.skeleton().is_some())
            .ok_or_else(|| Error::Serialization(format!("{} is not a remote type", inst.type_name())))?;
        Ok(self.inner.registry.register_local_object(inst.object(), surrogate.name(), &surrogate.interfaces()))
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the channel has closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tells the peer to close, then closes this side.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let seq = self.inner.next_seq();
        let mut enc = Encoder::with_buffer(self.inner.pool.take());
        frame::encode_shutdown(&mut enc, seq)?;
        let bytes = self.inner.pool.wrap(enc.into_bytes()?);
        let sent = self.inner.send_frame(&bytes).await;
        self.inner
            .close_with(Error::Connectivity("connection shut down locally".into()))
            .await;
        sent
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.inner.config.side_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Flow {
    Continue,
    Shutdown,
}

impl ConnectionInner {
    fn next_seq(&self) -> u64 {
        self.seq_gen.fetch_add(1, Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connectivity(format!("{}: channel is closed", self.config.side_name)));
        }
        Ok(())
    }

    async fn send_frame(&self, bytes: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.transport.send(bytes).await?;
        Ok(())
    }

    pub(crate) async fn invoke(self: &Arc<Self>, target: &ObjectId, method: &str, args: Vec<Value>) -> Result<Value> {
        if target.as_str().is_empty() {
            return Err(Error::InvalidTarget("empty target object id".into()));
        }
        if method.is_empty() {
            return Err(Error::InvalidTarget("empty method name".into()));
        }
        self.request(&args, |seq, enc, wire| CallEncoder::new(seq, target.as_str(), method, wire).encode(enc))
            .await
    }

    /// The caller side of one round trip.
    async fn request(
        self: &Arc<Self>,
        args: &[Value],
        write: impl FnOnce(u64, &mut Encoder, &[WireArg<'static>]) -> Result<()>,
    ) -> Result<Value> {
        self.ensure_open()?;

        // nothing is sent if any argument fails to marshal, and exports
        // taken for an unsent frame are given back when `exports` drops
        let (seq, frame, exports) = {
            let mut encoded = Marshaller::new(self).encode_args(args)?;
            let seq = self.next_seq();
            let mut enc = Encoder::with_buffer(self.pool.take());
            write(seq, &mut enc, &encoded.args)?;
            encoded.ctx.drain_into(&mut enc)?;
            (seq, self.pool.wrap(enc.into_bytes()?), encoded.exports)
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(Error::Connectivity(format!("{}: channel is closed", self.config.side_name)));
        }

        if let Err(e) = self.send_frame(&frame).await {
            self.pending.remove(&seq);
            return Err(e);
        }
        exports.commit();
        drop(frame);

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connectivity("reply channel dropped".into())),
            Err(_) => {
                self.pending.remove(&seq);
                warn!("{}: call {} timed out", self.config.side_name, seq);
                Err(Error::Timeout)
            }
        }
    }

    async fn pump(self: Arc<Self>) {
        let error = loop {
            match self.transport.recv().await {
                Ok(Some(msg)) => match self.handle_frame(msg) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Shutdown) => {
                        info!("{}: peer shut down the channel", self.config.side_name);
                        break Error::Connectivity("peer shut down".into());
                    }
                    Err(e) => {
                        error!("{}: error handling frame in pump: {}", self.config.side_name, e);
                        break e;
                    }
                },
                Ok(None) => break Error::Connectivity("stream closed".into()),
                Err(e) => {
                    warn!("{}: transport error in pump: {}", self.config.side_name, e);
                    break e.into();
                }
            }
        };
        self.close_with(error).await;
    }

    fn handle_frame(self: &Arc<Self>, msg: Vec<u8>) -> Result<Flow> {
        let header = frame::decode_header(&msg)?;
        match header.kind {
            FunctionKind::MethodCall | FunctionKind::CreateInstance => {
                tokio::spawn(self.clone().serve(header.seq, msg));
                Ok(Flow::Continue)
            }
            FunctionKind::Reply => {
                self.route_reply(&msg)?;
                Ok(Flow::Continue)
            }
            FunctionKind::ReleaseInstance => {
                if let Frame::ReleaseInstance { object_id, count } = Inbound::decode(&msg)?.frame {
                    let removed = self.registry.release(object_id, count);
                    debug!("{}: peer released {} x{} (removed: {})", self.config.side_name, object_id, count, removed);
                }
                Ok(Flow::Continue)
            }
            FunctionKind::Shutdown => Ok(Flow::Shutdown),
        }
    }

    fn route_reply(self: &Arc<Self>, msg: &[u8]) -> Result<()> {
        let mut inbound = Inbound::decode(msg)?;
        let seq = inbound.header.seq;
        let Frame::Reply(status) = inbound.frame else {
            return Err(Error::Protocol("reply header with non-reply body".into()));
        };

        let result = match status {
            Ok(arg) => Marshaller::new(self).decode_one(arg, &mut inbound.segments),
            Err(fault) => Err(Error::Remote(fault)),
        };

        let fatal = match &result {
            Err(e @ Error::Protocol(_)) => Some(e.clone()),
            _ => None,
        };

        match self.pending.remove(&seq) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            // late reply after a timeout; any proxy it created drops here
            None => debug!("{}: no pending call for reply {}", self.config.side_name, seq),
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The owner side of one round trip.
    async fn serve(self: Arc<Self>, seq: u64, msg: Vec<u8>) {
        let outcome = std::panic::AssertUnwindSafe(self.dispatch(&msg)).catch_unwind().await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(Fault::raised("handler panicked")),
        };
        if let Err(fault) = &outcome {
            debug!("{}: call {} faulted: {}", self.config.side_name, seq, fault);
        }
        if let Err(e) = self.send_reply(seq, outcome).await {
            warn!("{}: failed to send reply {}: {}", self.config.side_name, seq, e);
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: &[u8]) -> std::result::Result<Value, Fault> {
        let mut inbound = Inbound::decode(msg)?;
        match inbound.frame {
            Frame::MethodCall { target, method, args } => {
                let (object, type_name) = self.registry.resolve_local(target).ok_or_else(|| {
                    Fault::new(FaultKind::InstanceNotFound, "", format!("no object with id '{}'", target))
                })?;
                let skeleton = self.surrogates.skeleton_of(object.as_ref()).ok_or_else(|| {
                    Fault::new(FaultKind::MethodNotFound, type_name.clone(), "type has no dispatch table")
                })?;
                let values = Marshaller::new(self).decode_args(args, &mut inbound.segments)?;
                let pending = skeleton.invoke(object, method, Args::new(values))?;
                pending.await
            }
            Frame::CreateInstance { type_name, args } => {
                let skeleton = self
                    .surrogates
                    .by_name(type_name)
                    .and_then(|s| s.skeleton())
                    .ok_or_else(|| Fault::new(FaultKind::MethodNotFound, type_name, "unknown remote type"))?;
                let values = Marshaller::new(self).decode_args(args, &mut inbound.segments)?;
                let object = skeleton.construct(Args::new(values))?;
                Ok(Value::from_object(object, type_name))
            }
            _ => Err(Fault::new(FaultKind::Protocol, "", "frame is not a call")),
        }
    }

    async fn send_reply(self: &Arc<Self>, seq: u64, outcome: std::result::Result<Value, Fault>) -> Result<()> {
        let (bytes, exports) = match outcome {
            Ok(value) => match self.encode_reply(seq, &value) {
                Ok((bytes, exports)) => (bytes, Some(exports)),
                Err(e) => {
                    debug!("{}: reply {} could not be marshaled: {}", self.config.side_name, seq, e);
                    (self.encode_fault(seq, &Fault::from(e))?, None)
                }
            },
            Err(fault) => (self.encode_fault(seq, &fault)?, None),
        };
        let frame = self.pool.wrap(bytes);
        self.send_frame(&frame).await?;
        if let Some(exports) = exports {
            exports.commit();
        }
        Ok(())
    }

    fn encode_reply<'s>(self: &'s Arc<Self>, seq: u64, value: &Value) -> Result<(Vec<u8>, PendingExports<'s>)> {
        let mut encoded = Marshaller::new(self).encode_args(std::slice::from_ref(value))?;
        let result = encoded
            .args
            .pop()
            .ok_or_else(|| Error::Serialization("reply without result".into()))?;
        let mut enc = Encoder::with_buffer(self.pool.take());
        ReplyOkEncoder::new(seq, &result).encode(&mut enc)?;
        encoded.ctx.drain_into(&mut enc)?;
        Ok((enc.into_bytes()?, encoded.exports))
    }

    fn encode_fault(&self, seq: u64, fault: &Fault) -> Result<Vec<u8>> {
        let mut enc = Encoder::with_buffer(self.pool.take());
        ReplyErrEncoder::new(seq, fault).encode(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    /// Called when the last clone of a proxy drops.
    pub(crate) fn release_proxy(self: &Arc<Self>, id: &ObjectId, dying: *const ProxyInner, count: u64) {
        self.registry.forget_proxy(id, dying);
        if count == 0 || self.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("{}: no runtime to release {}", self.config.side_name, id);
            return;
        };
        let conn = self.clone();
        let id = id.clone();
        runtime.spawn(async move {
            if let Err(e) = conn.send_release(&id, count).await {
                debug!("{}: release of {} not delivered: {}", conn.config.side_name, id, e);
            }
        });
    }

    async fn send_release(&self, id: &ObjectId, count: u64) -> Result<()> {
        let mut enc = Encoder::with_buffer(self.pool.take());
        frame::encode_release(&mut enc, self.next_seq(), id.as_str(), count)?;
        let frame = self.pool.wrap(enc.into_bytes()?);
        self.send_frame(&frame).await
    }

    /// Marks the channel closed, fails every pending call and clears the registry.
    async fn close_with(&self, error: Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("{}: channel closed: {}", self.config.side_name, error);

        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }

        let dropped = self.registry.clear();
        debug!("{}: dropped {} registry entries", self.config.side_name, dropped);

        if let Err(e) = self.transport.close().await {
            debug!("{}: transport close failed: {}", self.config.side_name, e);
        }
        self.closed_tx.send_replace(true);
    }
}
