//! End-to-end tests for two endpoints wired to each other in memory.
//!
//! The "host" and "guest" here are symmetric: each side binds services and
//! takes stubs for the other side's services.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use zipline_bridge::{
    BridgeError, CallChannel, CodecRegistry, EngineError, Flow, FunctionDescriptor, GuestCode,
    GuestEngine, ServiceDescriptor, Value, Zipline, ZiplineException, ZiplineFunction,
    ZiplineService,
};
use zipline_testing::{
    ECHO_SIGNATURE, ECHO_WITHOUT_ARGS_SIGNATURE, EchoRequest, EchoResponse, EchoService,
    FakeEngine, LoggingEventListener, SUSPENDING_ECHO_SIGNATURE, SuspendingEchoService,
    echo_codecs, echo_service_descriptor, echo_service_without_args_descriptor, endpoint_pair,
    init_tracing, suspending_echo_service_descriptor,
};

fn request(message: &str) -> Value {
    Value::data(&EchoRequest {
        message: message.into(),
    })
    .unwrap()
}

fn message(value: Value) -> String {
    value.into_data::<EchoResponse>().unwrap().message
}

/// Poll `condition` until it holds, yielding to other tasks in between.
async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ── Plain calls ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_round_trip_fires_call_events() {
    init_tracing();
    let pair = endpoint_pair(Arc::new(echo_codecs()));
    pair.host
        .bind("helloService", Arc::new(EchoService::new("hello")), &echo_service_descriptor())
        .unwrap();
    assert_eq!(pair.guest.client_names(), ["helloService"]);

    let stub = pair.guest.take("helloService", &echo_service_descriptor()).unwrap();
    let response = stub.call(ECHO_SIGNATURE, vec![request("Jake")]).unwrap();
    assert_eq!(message(response), "hello, Jake");

    assert_eq!(
        pair.host_listener.take_all(),
        [
            "bindService helloService",
            r#"callStart helloService fn echo(EchoRequest): EchoResponse [{"message":"Jake"}]"#,
            r#"callEnd helloService fn echo(EchoRequest): EchoResponse {"message":"hello, Jake"}"#,
        ]
    );
    assert_eq!(
        pair.guest_listener.take_all(),
        [
            "takeService helloService",
            r#"callStart helloService fn echo(EchoRequest): EchoResponse [{"message":"Jake"}]"#,
            r#"callEnd helloService fn echo(EchoRequest): EchoResponse {"message":"hello, Jake"}"#,
        ]
    );
    stub.close();
}

#[tokio::test]
async fn incompatible_signature_lists_available_functions() {
    let pair = endpoint_pair(Arc::new(echo_codecs()));
    pair.host
        .bind("helloService", Arc::new(EchoService::new("hello")), &echo_service_descriptor())
        .unwrap();

    let stub = pair
        .guest
        .take("helloService", &echo_service_without_args_descriptor())
        .unwrap();
    let error = stub.call(ECHO_WITHOUT_ARGS_SIGNATURE, Vec::new()).unwrap_err();

    assert!(matches!(error, BridgeError::ApiMismatch(_)), "{error:?}");
    assert_eq!(
        error.to_string(),
        "no such method (incompatible API versions?)\n\
         \tcalled function:\n\
         \t\tfn echo(): EchoResponse\n\
         \tavailable functions:\n\
         \t\tfn echo(EchoRequest): EchoResponse\n\
         \t\tfn close(): ()"
    );
    stub.close();
}

#[tokio::test]
async fn missing_serializer_fails_at_bind_time() {
    let pair = endpoint_pair(Arc::new(CodecRegistry::new()));
    let error = pair
        .host
        .bind("helloService", Arc::new(EchoService::new("hello")), &echo_service_descriptor())
        .unwrap_err();
    assert!(
        matches!(error, BridgeError::SerializerNotConfigured { ref type_name, .. } if type_name == "EchoRequest"),
        "{error:?}"
    );
    assert!(pair.host.service_names().is_empty());
}

#[tokio::test]
async fn closing_a_stub_closes_the_service() {
    let pair = endpoint_pair(Arc::new(echo_codecs()));
    let service = Arc::new(EchoService::new("hello"));
    pair.host
        .bind("helloService", service.clone(), &echo_service_descriptor())
        .unwrap();

    let stub = pair.guest.take("helloService", &echo_service_descriptor()).unwrap();
    stub.close();

    assert!(service.is_closed());
    assert!(pair.host.service_names().is_empty());
    assert!(matches!(
        stub.call(ECHO_SIGNATURE, vec![request("Jake")]),
        Err(BridgeError::Closed(_))
    ));
}

// ── Pass-by-reference ────────────────────────────────────────────────────────

const REGISTER_SIGNATURE: &str = "fn register(EchoService): String";

fn registrar_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "Registrar",
        vec![FunctionDescriptor::new("register", &["EchoService"], "String")],
    )
}

/// Calls the echo service it is handed once, then closes it.
struct Registrar;

impl ZiplineService for Registrar {
    fn call(&self, _function: &ZiplineFunction, args: Vec<Value>) -> Result<Value, ZiplineException> {
        let echo = args
            .into_iter()
            .next()
            .unwrap_or(Value::Null)
            .into_remote_service()?;
        let response: EchoResponse = echo
            .call(ECHO_SIGNATURE, vec![Value::data(&EchoRequest { message: "from host".into() })?])?
            .into_data()?;
        echo.close();
        Ok(Value::string(response.message))
    }
}

#[tokio::test]
async fn services_pass_by_reference() {
    let mut codecs = echo_codecs();
    codecs.register_service(registrar_descriptor());
    let pair = endpoint_pair(Arc::new(codecs));
    pair.host
        .bind("registrar", Arc::new(Registrar), &registrar_descriptor())
        .unwrap();

    let registrar = pair.guest.take("registrar", &registrar_descriptor()).unwrap();
    let echo = Arc::new(EchoService::new("hi"));
    let reply: String = registrar
        .call(REGISTER_SIGNATURE, vec![Value::service(echo.clone())])
        .unwrap()
        .into_data()
        .unwrap();

    assert_eq!(reply, "hi, from host");
    assert_eq!(echo.requests(), ["from host"]);
    assert!(echo.is_closed());
    assert!(pair.guest.service_names().is_empty());
    assert!(
        pair.guest_listener
            .take_all()
            .contains(&"bindService zipline/guest-1".to_string())
    );
    registrar.close();
}

// ── Suspending calls ─────────────────────────────────────────────────────────

#[tokio::test]
async fn suspending_call_round_trip() {
    let pair = endpoint_pair(Arc::new(echo_codecs()));
    let service = Arc::new(SuspendingEchoService::new("hello"));
    pair.host
        .bind("suspendingEcho", service.clone(), &suspending_echo_service_descriptor())
        .unwrap();
    let stub = pair
        .guest
        .take("suspendingEcho", &suspending_echo_service_descriptor())
        .unwrap();

    service.release(1);
    let response = stub
        .call_suspending(SUSPENDING_ECHO_SIGNATURE, vec![request("Jake")])
        .await
        .unwrap();
    assert_eq!(message(response), "hello, Jake");
    assert_eq!(service.completed(), 1);

    // Both callbacks unbind themselves.
    eventually(|| pair.host.service_names() == ["suspendingEcho"]).await;
    assert!(pair.guest.service_names().is_empty());
    stub.close();
}

#[tokio::test]
async fn dropping_a_suspended_call_cancels_it() {
    let pair = endpoint_pair(Arc::new(echo_codecs()));
    let service = Arc::new(SuspendingEchoService::new("hello"));
    pair.host
        .bind("suspendingEcho", service.clone(), &suspending_echo_service_descriptor())
        .unwrap();
    let stub = pair
        .guest
        .take("suspendingEcho", &suspending_echo_service_descriptor())
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        stub.call_suspending(SUSPENDING_ECHO_SIGNATURE, vec![request("Jake")]),
    )
    .await;
    assert!(result.is_err(), "call should still be pending");

    eventually(|| service.cancelled() == 1).await;
    assert_eq!(service.completed(), 0);
    assert_eq!(pair.host.service_names(), ["suspendingEcho"]);
    assert!(pair.guest.service_names().is_empty());
    stub.close();
}

#[tokio::test]
async fn closing_the_caller_cancels_pending_calls() {
    let pair = endpoint_pair(Arc::new(echo_codecs()));
    let service = Arc::new(SuspendingEchoService::new("hello"));
    pair.host
        .bind("suspendingEcho", service.clone(), &suspending_echo_service_descriptor())
        .unwrap();
    let stub = pair
        .guest
        .take("suspendingEcho", &suspending_echo_service_descriptor())
        .unwrap();

    let pending = tokio::spawn(async move {
        stub.call_suspending(SUSPENDING_ECHO_SIGNATURE, vec![request("Jake")])
            .await
    });
    eventually(|| pair.host.service_names().len() == 2).await;

    pair.guest.close();
    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("close must not leave the call hanging")
        .unwrap();
    assert!(matches!(result, Err(BridgeError::Cancelled(ref m)) if m == "Zipline closed"), "{result:?}");
}

// ── Flows ────────────────────────────────────────────────────────────────────

const COUNT_SIGNATURE: &str = "fn count(i32): Flow<String>";

fn counter_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(
        "Counter",
        vec![FunctionDescriptor::new("count", &["i32"], "Flow<String>")],
    )
}

struct Counter;

impl ZiplineService for Counter {
    fn call(&self, _function: &ZiplineFunction, args: Vec<Value>) -> Result<Value, ZiplineException> {
        let limit: i32 = args.into_iter().next().unwrap_or(Value::Null).into_data()?;
        let values = (0..limit).map(|i| Value::string(i.to_string())).collect();
        Ok(Value::Flow(Flow::from_values(values)))
    }
}

#[tokio::test]
async fn flows_stream_across_the_bridge() {
    let mut codecs = echo_codecs();
    codecs.register_service(counter_descriptor());
    let pair = endpoint_pair(Arc::new(codecs));
    pair.host
        .bind("counter", Arc::new(Counter), &counter_descriptor())
        .unwrap();

    let counter = pair.guest.take("counter", &counter_descriptor()).unwrap();
    let flow = counter
        .call(COUNT_SIGNATURE, vec![Value::data(&3).unwrap()])
        .unwrap()
        .into_flow()
        .unwrap();

    let items = tokio::time::timeout(Duration::from_secs(5), flow.into_stream().collect::<Vec<_>>())
        .await
        .expect("flow should complete");
    let items: Vec<String> = items
        .into_iter()
        .map(|item| item.unwrap().into_data().unwrap())
        .collect();
    assert_eq!(items, ["0", "1", "2"]);

    // The flow service and its collector are released once collection ends.
    eventually(|| pair.host.service_names() == ["counter"]).await;
    eventually(|| pair.guest.service_names().is_empty()).await;
    counter.close();
}

// ── Host object ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn zipline_close_is_idempotent() {
    let codecs = Arc::new(echo_codecs());
    let listener = Arc::new(LoggingEventListener::new());
    let engine = FakeEngine::new(codecs.clone());
    let guest = engine.guest();
    let zipline = Zipline::create(Box::new(engine), codecs, listener.clone());

    guest
        .bind("echoService", Arc::new(EchoService::new("hi")), &echo_service_descriptor())
        .unwrap();
    assert_eq!(zipline.client_names(), ["echoService"]);

    zipline.close();
    zipline.close();

    assert_eq!(listener.take_all(), ["ziplineCreated", "ziplineClosed"]);
    assert!(guest.is_closed());
    assert!(matches!(
        zipline.evaluate("globalThis.log", "a.js"),
        Err(BridgeError::Closed(_))
    ));
    assert!(matches!(
        zipline.take("echoService", &echo_service_descriptor()),
        Err(BridgeError::Closed(_))
    ));
}

#[tokio::test]
async fn zipline_loads_modules_and_calls_main() {
    let codecs = Arc::new(echo_codecs());
    let listener = Arc::new(LoggingEventListener::new());
    let zipline = Zipline::create(Box::new(FakeEngine::new(codecs.clone())), codecs, listener.clone());

    let bundle = zipline_bridge::ZiplineFile::new(b"log alpha loaded".to_vec()).write().unwrap();
    zipline.load_module(&bundle, "alpha").unwrap();
    zipline.load_js_module("log bravo loaded", "bravo").unwrap();
    zipline.call_main("bravo", "main").unwrap();

    assert_eq!(
        zipline.evaluate("globalThis.log", "log.js").unwrap(),
        serde_json::json!("alpha loaded\nbravo loaded\n")
    );
    assert_eq!(
        zipline.evaluate("globalThis.mainCalls", "calls.js").unwrap(),
        serde_json::json!(["bravo.main"])
    );
    assert_eq!(
        listener.take_all(),
        [
            "ziplineCreated",
            "moduleLoadStart alpha",
            "moduleLoadEnd alpha",
            "moduleLoadStart bravo",
            "moduleLoadEnd bravo",
        ]
    );

    let error = zipline.load_module(b"not a bundle", "charlie").unwrap_err();
    assert!(matches!(error, BridgeError::Bundle(_)), "{error:?}");
    zipline.close();
}

#[tokio::test]
async fn call_main_rejects_unquotable_entry_points() {
    let codecs = Arc::new(echo_codecs());
    let zipline = Zipline::create(
        Box::new(FakeEngine::new(codecs.clone())),
        codecs,
        Arc::new(LoggingEventListener::new()),
    );

    let error = zipline.call_main("bravo').x();require('alpha", "main").unwrap_err();
    assert!(matches!(error, BridgeError::InvalidEntryPoint(_)), "{error:?}");
    let error = zipline.call_main("bravo", "main() ; log").unwrap_err();
    assert!(matches!(error, BridgeError::InvalidEntryPoint(_)), "{error:?}");

    zipline.call_main("./bravo-1.js", "$main_2").unwrap();
    assert_eq!(
        zipline.evaluate("globalThis.mainCalls", "calls.js").unwrap(),
        serde_json::json!(["./bravo-1.js.$main_2"])
    );
    zipline.close();
}

// ── Guest context ────────────────────────────────────────────────────────────

/// Records whether anything entered the engine while another entry was in
/// progress.
#[derive(Default)]
struct Occupancy {
    inside: AtomicBool,
    overlapped: AtomicBool,
}

impl Occupancy {
    fn enter(&self) {
        if self.inside.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.inside.store(false, Ordering::SeqCst);
    }
}

/// A [`FakeEngine`] whose evaluation takes a while, and which calls the
/// host's "relay" service when evaluating `relay.js`.
struct WatchedEngine {
    inner: FakeEngine,
    occupancy: Arc<Occupancy>,
}

impl GuestEngine for WatchedEngine {
    fn evaluate(&mut self, code: GuestCode<'_>, file_name: &str) -> Result<serde_json::Value, EngineError> {
        if file_name == "relay.js" {
            let relay = self
                .inner
                .guest()
                .take("relay", &echo_service_descriptor())
                .map_err(|e| EngineError::new(e.to_string()))?;
            let response = relay
                .call(ECHO_SIGNATURE, vec![request("guest")])
                .map_err(|e| EngineError::new(e.to_string()));
            relay.close();
            return Ok(serde_json::Value::String(message(response?)));
        }

        self.occupancy.enter();
        std::thread::sleep(Duration::from_millis(200));
        let result = self.inner.evaluate(code, file_name);
        self.occupancy.exit();
        result
    }

    fn compile(&mut self, source: &str, file_name: &str) -> Result<Vec<u8>, EngineError> {
        self.inner.compile(source, file_name)
    }

    fn inbound_channel(&self) -> Arc<dyn CallChannel> {
        Arc::new(WatchedChannel {
            inner: self.inner.inbound_channel(),
            occupancy: self.occupancy.clone(),
        })
    }

    fn set_outbound_channel(&mut self, channel: Arc<dyn CallChannel>) {
        self.inner.set_outbound_channel(channel);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

struct WatchedChannel {
    inner: Arc<dyn CallChannel>,
    occupancy: Arc<Occupancy>,
}

impl CallChannel for WatchedChannel {
    fn service_names(&self) -> Vec<String> {
        self.inner.service_names()
    }

    fn call(&self, encoded_call: &str) -> String {
        self.occupancy.enter();
        let response = self.inner.call(encoded_call);
        self.occupancy.exit();
        response
    }

    fn disconnect(&self, name: &str) -> bool {
        self.inner.disconnect(name)
    }
}

fn watched_zipline() -> (Arc<Zipline>, Arc<zipline_bridge::Endpoint>, Arc<Occupancy>) {
    let codecs = Arc::new(echo_codecs());
    let occupancy = Arc::new(Occupancy::default());
    let engine = WatchedEngine {
        inner: FakeEngine::new(codecs.clone()),
        occupancy: occupancy.clone(),
    };
    let guest = engine.inner.guest();
    let zipline = Zipline::create(Box::new(engine), codecs, Arc::new(LoggingEventListener::new()));
    (zipline, guest, occupancy)
}

#[test]
fn host_calls_wait_for_guest_evaluation() {
    let (zipline, guest, occupancy) = watched_zipline();
    guest
        .bind("echoService", Arc::new(EchoService::new("hi")), &echo_service_descriptor())
        .unwrap();
    let stub = zipline.take("echoService", &echo_service_descriptor()).unwrap();

    let evaluation = {
        let zipline = zipline.clone();
        std::thread::spawn(move || zipline.evaluate("log slow", "slow.js"))
    };
    while !occupancy.inside.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
    let response = stub.call(ECHO_SIGNATURE, vec![request("Jake")]).unwrap();
    evaluation.join().unwrap().unwrap();

    assert_eq!(message(response), "hi, Jake");
    assert!(!occupancy.overlapped.load(Ordering::SeqCst));
    stub.close();
    zipline.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suspend_callbacks_wait_for_guest_evaluation() {
    let (zipline, guest, occupancy) = watched_zipline();
    let service = Arc::new(SuspendingEchoService::new("hello"));
    zipline
        .bind("helloService", service.clone(), &suspending_echo_service_descriptor())
        .unwrap();
    let guest_stub = guest
        .take("helloService", &suspending_echo_service_descriptor())
        .unwrap();
    let call = tokio::spawn(async move {
        let response = guest_stub
            .call_suspending(SUSPENDING_ECHO_SIGNATURE, vec![request("Jake")])
            .await;
        guest_stub.close();
        response
    });
    // The host binds a cancel callback once the call is under way.
    eventually(|| zipline.service_names().len() == 2).await;

    // The callback completes while the guest is busy evaluating.
    let evaluation = {
        let zipline = zipline.clone();
        tokio::task::spawn_blocking(move || zipline.evaluate("log slow", "slow.js"))
    };
    while !occupancy.inside.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    service.release(1);

    assert_eq!(message(call.await.unwrap().unwrap()), "hello, Jake");
    evaluation.await.unwrap().unwrap();
    assert!(!occupancy.overlapped.load(Ordering::SeqCst));
    zipline.close();
}

#[test]
fn guest_to_host_to_guest_calls_reenter() {
    let (zipline, guest, _occupancy) = watched_zipline();
    guest
        .bind("echoService", Arc::new(EchoService::new("hi")), &echo_service_descriptor())
        .unwrap();
    // The host's relay forwards to the guest's echo service.
    let echo = zipline.take("echoService", &echo_service_descriptor()).unwrap();
    zipline
        .bind("relay", Arc::new(echo), &echo_service_descriptor())
        .unwrap();

    let reply = zipline.evaluate("", "relay.js").unwrap();
    assert_eq!(reply, serde_json::json!("hi, guest"));
    zipline.close();
}

/// A host service that tries to evaluate more guest code while it is being
/// called by the guest.
#[derive(Default)]
struct Evaluator {
    zipline: std::sync::OnceLock<std::sync::Weak<Zipline>>,
}

impl ZiplineService for Evaluator {
    fn call(&self, _function: &ZiplineFunction, _args: Vec<Value>) -> Result<Value, ZiplineException> {
        let zipline = self.zipline.get().and_then(std::sync::Weak::upgrade).unwrap();
        let error = zipline.evaluate("log nested", "nested.js").unwrap_err();
        Ok(Value::data(&EchoResponse {
            message: error.to_string(),
        })?)
    }
}

#[test]
fn nested_evaluation_fails_instead_of_deadlocking() {
    let (zipline, _guest, _occupancy) = watched_zipline();
    let evaluator = Arc::new(Evaluator::default());
    assert!(evaluator.zipline.set(Arc::downgrade(&zipline)).is_ok());
    zipline
        .bind("relay", evaluator, &echo_service_descriptor())
        .unwrap();

    let reply = zipline.evaluate("", "relay.js").unwrap();
    assert_eq!(reply, serde_json::json!("guest code is already running on this thread"));
    assert_eq!(
        zipline.evaluate("globalThis.log", "log.js").unwrap(),
        serde_json::json!("")
    );
    zipline.close();
}
