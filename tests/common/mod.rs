//! A test harness standing in for the storage tier.
//!
//! The harness owns the receiving end of a local name server's transport.
//! Tests pull outbound messages one by one and answer them by feeding
//! replies back into the server.

#![allow(dead_code)]

use gns::base::message::{
    ActiveSetResponse, LookupError, LookupRequest, LookupResponse,
    MutationConfirm, MutationRequest,
};
use gns::base::{Message, NodeId, ResponseCode, Ttl};
use gns::lns::nodes::{NodeConfig, NodeTable};
use gns::lns::transport::ChannelTransport;
use gns::lns::{Config, LocalNameServer};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// The replica controllers of every name.
pub const CONTROLLERS: [u32; 3] = [1, 2, 3];

/// The identifier of the local name server under test.
pub const LNS_ID: u32 = 100;

pub struct Harness {
    pub lns: LocalNameServer,
    outbound: mpsc::UnboundedReceiver<(NodeId, Message)>,
}

impl Harness {
    /// Creates a server whose node n is n * 10 ms away.
    pub fn new(config: Config) -> Self {
        init_logging();
        let mut table = NodeTable::new();
        for id in 1..=10 {
            table.set_latency(
                NodeId::new(id),
                Duration::from_millis(u64::from(id) * 10),
            );
        }
        let nodes = NodeConfig::new(CONTROLLERS.map(NodeId::new), 3, table);
        let (transport, outbound) = ChannelTransport::new();
        let lns = LocalNameServer::new(
            NodeId::new(LNS_ID),
            nodes,
            transport,
            config,
        );
        Self { lns, outbound }
    }

    /// Waits for the next outbound message.
    pub async fn next(&mut self) -> (NodeId, Message) {
        self.outbound.recv().await.expect("transport closed")
    }

    /// Returns an outbound message if one is queued.
    pub fn try_next(&mut self) -> Option<(NodeId, Message)> {
        self.outbound.try_recv().ok()
    }

    /// Drains all queued outbound messages.
    pub fn drain(&mut self) -> Vec<(NodeId, Message)> {
        let mut res = Vec::new();
        while let Some(item) = self.try_next() {
            res.push(item);
        }
        res
    }

    pub fn active_set(
        &self,
        name: &str,
        active: Option<&[u32]>,
        from: NodeId,
    ) {
        let active =
            active.map(|ids| ids.iter().copied().map(NodeId::new).collect());
        self.lns.handle_message(
            ActiveSetResponse {
                name: name.into(),
                active,
                responder: from,
            }
            .into(),
        );
    }

    pub fn lookup_response(
        &self,
        req: &LookupRequest,
        from: NodeId,
        value: &str,
        ttl: Option<i64>,
    ) {
        self.lns.handle_message(
            LookupResponse {
                request_id: req.request_id,
                value: vec![value.into()],
                ttl: ttl.map(Ttl::from_secs),
                responder: from,
                active: None,
            }
            .into(),
        );
    }

    pub fn lookup_error(
        &self,
        req: &LookupRequest,
        from: NodeId,
        code: ResponseCode,
    ) {
        self.lns.handle_message(
            LookupError {
                request_id: req.request_id,
                code,
                responder: from,
            }
            .into(),
        );
    }

    pub fn confirm(
        &self,
        req: &MutationRequest,
        from: NodeId,
        code: ResponseCode,
    ) {
        self.lns.handle_message(
            MutationConfirm {
                request_id: req.request_id,
                success: code == ResponseCode::NoError,
                code,
                responder: from,
            }
            .into(),
        );
    }
}

/// Lets every spawned task run until it waits for something.
///
/// With paused time the clock only moves once the runtime is idle, so a
/// short sleep returns after all other tasks have settled.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn controllers() -> Vec<NodeId> {
    CONTROLLERS.iter().copied().map(NodeId::new).collect()
}

pub fn value(s: &str) -> Vec<String> {
    vec![s.into()]
}

pub fn expect_active_set_request(msg: Message, name: &str) {
    match msg {
        Message::ActiveSetRequest(req) => {
            assert_eq!(req.name, name);
            assert_eq!(req.requesting_node, NodeId::new(LNS_ID));
        }
        msg => panic!("expected active set request, got {:?}", msg),
    }
}

pub fn expect_lookup(msg: Message) -> LookupRequest {
    match msg {
        Message::LookupRequest(req) => req,
        msg => panic!("expected lookup request, got {:?}", msg),
    }
}

pub fn expect_mutation(msg: Message) -> MutationRequest {
    match msg {
        Message::MutationRequest(req) => req,
        msg => panic!("expected mutation request, got {:?}", msg),
    }
}

/// Setup logging of events reported by the server.
///
/// Use the RUST_LOG environment variable to override the defaults.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
