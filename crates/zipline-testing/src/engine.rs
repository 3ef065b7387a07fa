//! An in-memory guest engine.
//!
//! Guest "code" is a line-oriented script:
//!
//! ```text
//! log alpha loaded        append "alpha loaded\n" to globalThis.log
//! globalThis.log          evaluate to the accumulated log
//! globalThis.mainCalls    evaluate to the entry points called so far
//! require('alpha').main() record a call to an entry point
//! throw boom              fail with "boom"
//! // comment
//! ```
//!
//! "Bytecode" is the script's UTF-8 bytes. The guest side of the bridge is a
//! real [`Endpoint`]; bind guest services on [`FakeEngine::guest`].

use std::sync::Arc;

use zipline_bridge::channel::GUEST_PASS_BY_REFERENCE_PREFIX;
use zipline_bridge::{
    CallChannel, CodecRegistry, DeferredChannel, Endpoint, EngineError, GuestCode, GuestEngine,
    NoopEventListener,
};

pub struct FakeEngine {
    guest: Arc<Endpoint>,
    outbound: Arc<DeferredChannel>,
    log: String,
    main_calls: Vec<String>,
    closed: bool,
}

enum Statement<'a> {
    Log(&'a str),
    ReadLog,
    ReadMainCalls,
    Require { module_id: &'a str, function: &'a str },
    Throw(&'a str),
}

impl FakeEngine {
    pub fn new(codecs: Arc<CodecRegistry>) -> Self {
        let outbound = Arc::new(DeferredChannel::new());
        let guest = Endpoint::new(
            GUEST_PASS_BY_REFERENCE_PREFIX,
            codecs,
            Arc::new(NoopEventListener),
            outbound.clone(),
        );
        Self {
            guest,
            outbound,
            log: String::new(),
            main_calls: Vec::new(),
            closed: false,
        }
    }

    /// A factory for loaders that create one engine per load.
    pub fn factory(codecs: Arc<CodecRegistry>) -> impl Fn() -> Box<dyn GuestEngine> + Send + Sync {
        move || -> Box<dyn GuestEngine> { Box::new(FakeEngine::new(codecs.clone())) }
    }

    /// The guest side of the bridge.
    pub fn guest(&self) -> Arc<Endpoint> {
        self.guest.clone()
    }

    fn run(&mut self, script: &str, file_name: &str) -> Result<serde_json::Value, EngineError> {
        let statements = parse(script, file_name)?;
        let mut completion = serde_json::Value::Null;
        for statement in statements {
            completion = match statement {
                Statement::Log(text) => {
                    self.log.push_str(text);
                    self.log.push('\n');
                    serde_json::Value::Null
                }
                Statement::ReadLog => serde_json::Value::String(self.log.clone()),
                Statement::ReadMainCalls => serde_json::Value::from(self.main_calls.clone()),
                Statement::Require { module_id, function } => {
                    self.main_calls.push(format!("{module_id}.{function}"));
                    serde_json::Value::Null
                }
                Statement::Throw(message) => return Err(EngineError::new(message)),
            };
        }
        Ok(completion)
    }
}

fn parse<'a>(script: &'a str, file_name: &str) -> Result<Vec<Statement<'a>>, EngineError> {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .map(|line| parse_statement(line, file_name))
        .collect()
}

fn parse_statement<'a>(line: &'a str, file_name: &str) -> Result<Statement<'a>, EngineError> {
    if let Some(text) = line.strip_prefix("log ") {
        return Ok(Statement::Log(text));
    }
    if let Some(message) = line.strip_prefix("throw ") {
        return Ok(Statement::Throw(message));
    }
    match line {
        "globalThis.log" => return Ok(Statement::ReadLog),
        "globalThis.mainCalls" => return Ok(Statement::ReadMainCalls),
        _ => {}
    }
    if let Some(rest) = line.strip_prefix("require('")
        && let Some((module_id, call)) = rest.split_once("').")
        && let Some(function) = call.strip_suffix("()")
    {
        return Ok(Statement::Require { module_id, function });
    }
    Err(EngineError::new(format!(
        "SyntaxError: unexpected statement in {file_name}: {line}"
    )))
}

impl GuestEngine for FakeEngine {
    fn evaluate(&mut self, code: GuestCode<'_>, file_name: &str) -> Result<serde_json::Value, EngineError> {
        if self.closed {
            return Err(EngineError::new("engine is closed"));
        }
        match code {
            GuestCode::Source(script) => self.run(script, file_name),
            GuestCode::Bytecode(bytes) => {
                let script = std::str::from_utf8(bytes)
                    .map_err(|e| EngineError::new(format!("corrupt bytecode in {file_name}: {e}")))?;
                self.run(script, file_name)
            }
        }
    }

    fn compile(&mut self, source: &str, file_name: &str) -> Result<Vec<u8>, EngineError> {
        parse(source, file_name)?;
        Ok(source.as_bytes().to_vec())
    }

    fn inbound_channel(&self) -> Arc<dyn CallChannel> {
        self.guest.inbound_channel()
    }

    fn set_outbound_channel(&mut self, channel: Arc<dyn CallChannel>) {
        if !self.outbound.connect(channel) {
            tracing::warn!("Guest outbound channel was already connected");
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.guest.close();
    }
}
