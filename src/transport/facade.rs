//! The transport facade: worker pool, connector cache, hedged invokes.
//!
//! A [`Transport`] owns N worker threads, each running one reactor loop, and
//! a cache of connectors keyed by `(peer, ConnectionType)`. New connectors
//! are assigned to reactors round-robin. Request ids come from one atomic
//! counter, so every in-flight call in the process is uniquely identified.
//!
//! The facade is callback-free at its surface: `invoke` returns a
//! [`ReplySlot`] the caller waits on, and `invoke_with_backup` additionally
//! hands back the [`BackupRequestRetryInfo`] recording which replica
//! answered.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::runtime::reactor::Reactor;
use crate::tracing_compat::{debug, info, warn};
use crate::transport::backup::{BackupRequestRetryInfo, SharedCompletion};
use crate::transport::call_map::{CallCompletion, ReplySlot};
use crate::transport::connector::{
    ComplexConnector, ConnectionType, Connector, ConnectorOptions, PipelineConnector,
    PoolConnector, Request,
};
use crate::transport::protocol::RequestEncoder;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Client-side transport entry point.
pub struct Transport {
    reactors: Vec<Arc<Reactor>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    next_reactor: AtomicUsize,
    next_request_id: AtomicU64,
    connectors: Mutex<HashMap<(SocketAddr, ConnectionType), Arc<dyn Connector>>>,
    opts: ConnectorOptions,
    cfg: TransportConfig,
    stopped: AtomicBool,
    self_ref: Weak<Self>,
}

impl Transport {
    /// Validates `cfg`, spawns the worker pool, and returns the running
    /// transport.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when a reactor cannot be created.
    pub fn new(mut cfg: TransportConfig, mut opts: ConnectorOptions) -> Result<Arc<Self>> {
        cfg.normalize()
            .map_err(|e| Error::connect(format!("invalid configuration: {e}")))?;
        // The normalized transport config is authoritative for connection
        // and call settings; the options carry only the protocol hooks.
        opts.connection = cfg.connection.clone();
        opts.call = cfg.call.clone();
        let workers = cfg.scheduler.effective_workers();

        let mut reactors = Vec::with_capacity(workers);
        for _ in 0..workers {
            let reactor = Reactor::new(cfg.reactor.clone())
                .map_err(|e| Error::connect(format!("reactor creation failed: {e}")))?;
            reactors.push(Arc::new(reactor));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(workers);
        for (idx, reactor) in reactors.iter().enumerate() {
            let reactor = Arc::clone(reactor);
            let stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("muxrpc-worker-{idx}"))
                .spawn(move || reactor.run(&stop))
                .map_err(|e| Error::connect(format!("worker spawn failed: {e}")))?;
            threads.push(handle);
        }
        info!(workers, "transport started");

        Ok(Arc::new_cyclic(|self_ref| Self {
            reactors,
            threads: Mutex::new(threads),
            stop,
            next_reactor: AtomicUsize::new(0),
            next_request_id: AtomicU64::new(1),
            connectors: Mutex::new(HashMap::new()),
            opts,
            cfg,
            stopped: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    /// Allocates a process-unique request id.
    fn alloc_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn next_reactor(&self) -> Arc<Reactor> {
        let idx = self.next_reactor.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        Arc::clone(&self.reactors[idx])
    }

    /// Returns the cached connector for `(peer, ctype)`, dialing a new one
    /// when none exists or the cached one has gone unhealthy.
    pub fn connector(
        &self,
        peer: SocketAddr,
        ctype: ConnectionType,
    ) -> Result<Arc<dyn Connector>> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::network("transport is stopped"));
        }
        let mut cache = self.connectors.lock();
        if let Some(existing) = cache.get(&(peer, ctype)) {
            if existing.is_healthy() {
                return Ok(Arc::clone(existing));
            }
            debug!(%peer, ?ctype, "replacing unhealthy connector");
        }
        let reactor = self.next_reactor();
        let opts = self.opts.clone();
        let connector: Arc<dyn Connector> = match ctype {
            ConnectionType::Multiplexed => ComplexConnector::init(peer, reactor, opts)?,
            ConnectionType::Pooled => PoolConnector::init(peer, reactor, opts)?,
            ConnectionType::Pipelined => PipelineConnector::init(peer, reactor, opts)?,
        };
        cache.insert((peer, ctype), Arc::clone(&connector));
        Ok(connector)
    }

    /// Sends a request over the multiplexed discipline and returns the slot
    /// the reply lands in.
    ///
    /// The facade allocates the request id and hands it to `encode`, which
    /// produces the wire bytes carrying that id.
    pub fn invoke(
        &self,
        target: SocketAddr,
        encode: impl FnOnce(u64) -> Bytes,
        timeout_ms: u64,
    ) -> Result<ReplySlot> {
        self.invoke_with_type(target, ConnectionType::Multiplexed, encode, timeout_ms)
    }

    /// Like [`Transport::invoke`], with an explicit connector discipline.
    pub fn invoke_with_type(
        &self,
        target: SocketAddr,
        ctype: ConnectionType,
        encode: impl FnOnce(u64) -> Bytes,
        timeout_ms: u64,
    ) -> Result<ReplySlot> {
        let connector = self.connector(target, ctype)?;
        let slot = ReplySlot::new();
        let request_id = self.alloc_request_id();
        connector.send_req_msg(Request {
            request_id,
            send_data: encode(request_id),
            timeout_ms,
            completion: CallCompletion::Direct(slot.completion()),
        })?;
        Ok(slot)
    }

    /// Hedged invoke: sends to `targets[0]` now and duplicates to the next
    /// address every `delay_ms` until a reply is ready.
    ///
    /// Returns the reply slot and the retry info whose
    /// `succ_rsp_node_index` records which replica answered.
    pub fn invoke_with_backup(
        &self,
        targets: &[SocketAddr],
        encode: RequestEncoder,
        delay_ms: u64,
        timeout_ms: u64,
    ) -> Result<(ReplySlot, Arc<BackupRequestRetryInfo>)> {
        if targets.is_empty() {
            return Err(Error::connect("backup invoke needs at least one target"));
        }
        let retry = Arc::new(BackupRequestRetryInfo::new(targets.to_vec(), delay_ms));
        let slot = ReplySlot::new();
        let shared = Arc::new(SharedCompletion::new(slot.completion(), Arc::clone(&retry)));

        self.send_replica(&shared, &encode, timeout_ms, 0)?;
        if targets.len() > 1 {
            self.arm_backup(Arc::clone(&shared), encode, timeout_ms, 1);
        }
        Ok((slot, retry))
    }

    /// Sends one request to replica `index`; the completion is the shared
    /// one raced across replicas. Each replica's wire bytes carry their own
    /// freshly allocated id.
    fn send_replica(
        &self,
        shared: &Arc<SharedCompletion>,
        encode: &RequestEncoder,
        timeout_ms: u64,
        index: usize,
    ) -> Result<()> {
        let peer = shared.retry().addrs[index];
        let connector = self.connector(peer, ConnectionType::Multiplexed)?;
        let request_id = self.alloc_request_id();
        connector.send_req_msg(Request {
            request_id,
            send_data: encode(request_id),
            timeout_ms,
            completion: CallCompletion::Shared {
                shared: Arc::clone(shared),
                node_index: index,
            },
        })
    }

    /// Arms the delay timer that sends replica `index` unless a reply won
    /// first.
    fn arm_backup(
        &self,
        shared: Arc<SharedCompletion>,
        encode: RequestEncoder,
        timeout_ms: u64,
        index: usize,
    ) {
        let delay_ms = shared.retry().delay_ms;
        let transport = self.self_ref.clone();
        self.next_reactor().timer().add_after(delay_ms, move || {
            if shared.is_reply_ready() {
                return;
            }
            let Some(transport) = transport.upgrade() else {
                return;
            };
            if let Err(err) = transport.send_replica(&shared, &encode, timeout_ms, index) {
                warn!(%err, index, "backup replica send failed");
            }
            if index + 1 < shared.retry().addrs.len() {
                transport.arm_backup(Arc::clone(&shared), Arc::clone(&encode), timeout_ms, index + 1);
            }
        });
    }

    /// Sends bytes with no reply expected, over the multiplexed discipline.
    pub fn send_only(&self, target: SocketAddr, data: Bytes) -> Result<()> {
        self.connector(target, ConnectionType::Multiplexed)?
            .send_only(data)
    }

    /// The effective configuration the transport runs with.
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    /// Stops every connector and worker thread. Idempotent; safe to call
    /// from any non-worker thread.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let connectors: Vec<_> = self.connectors.lock().drain().map(|(_, c)| c).collect();
        for connector in connectors {
            connector.stop();
        }
        self.stop.store(true, Ordering::Release);
        for reactor in &self.reactors {
            let _ = reactor.wake();
        }
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        info!("transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("workers", &self.reactors.len())
            .field("connectors", &self.connectors.lock().len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallConfig, ConnectionConfig};
    use crate::transport::filter::FilterChain;
    use crate::transport::protocol::FrameCheck;

    fn options() -> ConnectorOptions {
        ConnectorOptions {
            connection: ConnectionConfig::default(),
            call: CallConfig::default(),
            frame_checker: Arc::new(|buf: &mut bytes::BytesMut, frames: &mut Vec<Bytes>| {
                if buf.is_empty() {
                    return FrameCheck::Less;
                }
                frames.push(buf.split_to(buf.len()).freeze());
                FrameCheck::Full
            }),
            response_decoder: None,
            handshaker: None,
            socket_configurer: None,
            filters: FilterChain::new(),
        }
    }

    #[test]
    fn transport_config_drives_connector_options() {
        let mut cfg = TransportConfig::default();
        cfg.scheduler.workers = 1;
        cfg.call.default_timeout_ms = 1234;
        cfg.connection.connect_timeout_ms = 777;

        let transport = Transport::new(cfg, options()).expect("transport");
        assert_eq!(transport.opts.call.default_timeout_ms, 1234);
        assert_eq!(transport.opts.connection.connect_timeout_ms, 777);
        transport.stop();
    }
}
