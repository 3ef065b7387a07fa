use std::collections::VecDeque;
use std::error::Error;
use std::sync::{Mutex, MutexGuard, PoisonError};

use zipline_bridge::{Call, CallOutcome, CallToken, EventListener};

/// Records events as strings, oldest first.
///
/// Module fetch events are left out unless enabled with
/// [`with_fetch_events`](Self::with_fetch_events): concurrent fetches make
/// their order nondeterministic.
#[derive(Default)]
pub struct LoggingEventListener {
    events: Mutex<VecDeque<String>>,
    exceptions: Mutex<Vec<String>>,
    fetch_events: bool,
}

impl LoggingEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_events(mut self) -> Self {
        self.fetch_events = true;
        self
    }

    /// The oldest event not yet taken.
    pub fn take(&self) -> Option<String> {
        self.events().pop_front()
    }

    pub fn take_all(&self) -> Vec<String> {
        self.events().drain(..).collect()
    }

    /// The most recent failure reported to any hook.
    pub fn take_exception(&self) -> Option<String> {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log(&self, event: String) {
        self.events().push_back(event);
    }

    fn log_error(&self, event: String, error: &dyn Error) {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.to_string());
        self.log(event);
    }

    fn log_fetch(&self, event: String) {
        if self.fetch_events {
            self.log(event);
        }
    }
}

fn url(url: Option<&str>) -> &str {
    url.unwrap_or("null")
}

impl EventListener for LoggingEventListener {
    fn bind_service(&self, name: &str) {
        self.log(format!("bindService {name}"));
    }

    fn take_service(&self, name: &str) {
        self.log(format!("takeService {name}"));
    }

    fn call_start(&self, call: &Call) -> CallToken {
        self.log(format!(
            "callStart {} {} {}",
            call.service_name, call.signature, call.args
        ));
        None
    }

    fn call_end(&self, call: &Call, outcome: &CallOutcome, _token: CallToken) {
        let outcome = match outcome {
            CallOutcome::Success(value) => value.clone(),
            CallOutcome::Failure(exception) => exception.to_string(),
        };
        self.log(format!(
            "callEnd {} {} {outcome}",
            call.service_name, call.signature
        ));
    }

    fn service_leaked(&self, name: &str) {
        self.log(format!("serviceLeaked {name}"));
    }

    fn application_load_start(&self, application: &str, manifest_url: Option<&str>) {
        self.log(format!("applicationLoadStart {application} {}", url(manifest_url)));
    }

    fn application_load_skipped(&self, application: &str, manifest_url: &str) {
        self.log(format!("applicationLoadSkipped {application} {manifest_url}"));
    }

    fn application_load_success(&self, application: &str, manifest_url: Option<&str>) {
        self.log(format!("applicationLoadSuccess {application} {}", url(manifest_url)));
    }

    fn application_load_failed(
        &self,
        application: &str,
        _manifest_url: Option<&str>,
        error: &dyn Error,
    ) {
        self.log_error(format!("applicationLoadFailed {application} {error}"), error);
    }

    fn download_start(&self, application: &str, url: &str) {
        self.log(format!("downloadStart {application} {url}"));
    }

    fn download_end(&self, application: &str, url: &str) {
        self.log(format!("downloadEnd {application} {url}"));
    }

    fn download_failed(&self, application: &str, url: &str, error: &dyn Error) {
        self.log_error(format!("downloadFailed {application} {url}"), error);
    }

    fn manifest_parse_failed(&self, application: &str, manifest_url: Option<&str>, error: &dyn Error) {
        self.log_error(
            format!("manifestParseFailed {application} {}", url(manifest_url)),
            error,
        );
    }

    fn module_load_start(&self, module_id: &str) {
        self.log(format!("moduleLoadStart {module_id}"));
    }

    fn module_load_end(&self, module_id: &str) {
        self.log(format!("moduleLoadEnd {module_id}"));
    }

    fn module_fetch_permit_acquire_start(&self, application: &str, module_id: &str) {
        self.log_fetch(format!("moduleFetchPermitAcquireStart {application} {module_id}"));
    }

    fn module_fetch_permit_acquire_end(&self, application: &str, module_id: &str) {
        self.log_fetch(format!("moduleFetchPermitAcquireEnd {application} {module_id}"));
    }

    fn module_fetch_start(&self, application: &str, module_id: &str, fetcher: &str) {
        self.log_fetch(format!("moduleFetchStart {application} {module_id} {fetcher}"));
    }

    fn module_fetch_end(&self, application: &str, module_id: &str, fetcher: &str, found: bool) {
        self.log_fetch(format!(
            "moduleFetchEnd {application} {module_id} {fetcher} {found}"
        ));
    }

    fn module_fetch_failed(
        &self,
        application: &str,
        module_id: &str,
        fetcher: &str,
        error: &dyn Error,
    ) {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error.to_string());
        self.log_fetch(format!("moduleFetchFailed {application} {module_id} {fetcher}"));
    }

    fn zipline_created(&self) {
        self.log("ziplineCreated".to_string());
    }

    fn zipline_closed(&self) {
        self.log("ziplineClosed".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for Boom {}

    #[test]
    fn events_are_taken_in_order() {
        let listener = LoggingEventListener::new();
        listener.bind_service("a");
        listener.take_service("b");
        listener.module_fetch_start("app", "alpha", "http");

        assert_eq!(listener.take().as_deref(), Some("bindService a"));
        assert_eq!(listener.take_all(), ["takeService b"]);
        assert_eq!(listener.take(), None);
    }

    #[test]
    fn failures_are_recorded() {
        let listener = LoggingEventListener::new().with_fetch_events();
        listener.module_fetch_failed("app", "alpha", "http", &Boom);
        listener.application_load_failed("app", None, &Boom);

        assert_eq!(
            listener.take_all(),
            ["moduleFetchFailed app alpha http", "applicationLoadFailed app boom"]
        );
        assert_eq!(listener.take_exception().as_deref(), Some("boom"));
        assert_eq!(listener.take_exception().as_deref(), Some("boom"));
        assert_eq!(listener.take_exception(), None);
    }
}
