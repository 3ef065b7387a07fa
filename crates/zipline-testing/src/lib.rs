//! Shared fakes for the zipline test suites: an in-memory guest engine,
//! echo services, an event recorder and fixed signing keys.

pub mod echo;
pub mod engine;
pub mod listener;

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};
use zipline_bridge::channel::{GUEST_PASS_BY_REFERENCE_PREFIX, HOST_PASS_BY_REFERENCE_PREFIX};
use zipline_bridge::{CodecRegistry, DeferredChannel, Endpoint};

pub use echo::{
    ECHO_SIGNATURE, ECHO_WITHOUT_ARGS_SIGNATURE, EchoRequest, EchoResponse, EchoService,
    SUSPENDING_ECHO_SIGNATURE, SuspendingEchoService, echo_codecs, echo_service_descriptor,
    echo_service_without_args_descriptor, suspending_echo_service_descriptor,
};
pub use engine::FakeEngine;
pub use listener::LoggingEventListener;

/// Route `tracing` output to the test harness, filtered by `ZIPLINE_LOG`.
pub fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_env("ZIPLINE_LOG"))
        .with_test_writer()
        .try_init();
}

/// Two endpoints wired to each other, each with its own event log.
pub struct EndpointPair {
    pub host: Arc<Endpoint>,
    pub guest: Arc<Endpoint>,
    pub host_listener: Arc<LoggingEventListener>,
    pub guest_listener: Arc<LoggingEventListener>,
}

pub fn endpoint_pair(codecs: Arc<CodecRegistry>) -> EndpointPair {
    let host_listener = Arc::new(LoggingEventListener::new());
    let guest_listener = Arc::new(LoggingEventListener::new());
    let host_outbound = Arc::new(DeferredChannel::new());
    let guest_outbound = Arc::new(DeferredChannel::new());

    let host = Endpoint::new(
        HOST_PASS_BY_REFERENCE_PREFIX,
        codecs.clone(),
        host_listener.clone(),
        host_outbound.clone(),
    );
    let guest = Endpoint::new(
        GUEST_PASS_BY_REFERENCE_PREFIX,
        codecs,
        guest_listener.clone(),
        guest_outbound.clone(),
    );
    host_outbound.connect(guest.inbound_channel());
    guest_outbound.connect(host.inbound_channel());

    EndpointPair {
        host,
        guest,
        host_listener,
        guest_listener,
    }
}

/// An Ed25519 key pair, hex encoded.
#[derive(Debug, Clone, Copy)]
pub struct SampleKey {
    pub name: &'static str,
    pub private_key: &'static str,
    pub public_key: &'static str,
}

/// Fixed signing keys so signed fixtures are reproducible.
pub struct SampleKeys;

impl SampleKeys {
    pub const KEY1: SampleKey = SampleKey {
        name: "key1",
        private_key: "ae4737d95a6d2d7e2f5e0b6d5c3b2a1908f7e6d5c4b3a29180706f5e4d3c2b1a",
        public_key: "ccc7eaede56773b3b58145159a6da95b614eafb528f0068ee932ebf5978f0d87",
    };

    pub const KEY2: SampleKey = SampleKey {
        name: "key2",
        private_key: "6a14e5c7b9d8f3a2c1e0d9b8a7f6e5d4c3b2a1908172635445362718a9b8c7d6",
        public_key: "3aa68efd762c0599ce348cb8701d4804ad2ad13b29d2cdc4a0c9bcc269c89e9e",
    };
}
