//! # Event listener
//!
//! Fire-and-forget hooks for telemetry. Every hook has a no-op default, so
//! listeners implement only what they care about. Hooks are called on the
//! thread doing the work: they must return quickly and must not call back
//! into the bridge or the loader.

use std::any::Any;
use std::error::Error;

use crate::exception::ZiplineException;

/// Opaque value returned by [`EventListener::call_start`] and handed back to
/// [`EventListener::call_end`].
pub type CallToken = Option<Box<dyn Any + Send>>;

/// A call crossing the bridge, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub service_name: String,
    pub signature: String,
    /// Arguments rendered as JSON, e.g. `[{"message":"Jake"}]`.
    pub args: String,
    pub suspending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success(String),
    Failure(ZiplineException),
}

#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn bind_service(&self, name: &str) {}

    fn take_service(&self, name: &str) {}

    fn call_start(&self, call: &Call) -> CallToken {
        None
    }

    fn call_end(&self, call: &Call, outcome: &CallOutcome, token: CallToken) {}

    /// A stub was dropped without being closed.
    fn service_leaked(&self, name: &str) {}

    fn application_load_start(&self, application: &str, manifest_url: Option<&str>) {}

    /// The fetched manifest is identical to the one already running.
    fn application_load_skipped(&self, application: &str, manifest_url: &str) {}

    fn application_load_success(&self, application: &str, manifest_url: Option<&str>) {}

    fn application_load_failed(
        &self,
        application: &str,
        manifest_url: Option<&str>,
        error: &dyn Error,
    ) {
    }

    fn download_start(&self, application: &str, url: &str) {}

    fn download_end(&self, application: &str, url: &str) {}

    fn download_failed(&self, application: &str, url: &str, error: &dyn Error) {}

    fn manifest_parse_failed(&self, application: &str, url: Option<&str>, error: &dyn Error) {}

    fn module_load_start(&self, module_id: &str) {}

    fn module_load_end(&self, module_id: &str) {}

    fn module_fetch_permit_acquire_start(&self, application: &str, module_id: &str) {}

    fn module_fetch_permit_acquire_end(&self, application: &str, module_id: &str) {}

    fn module_fetch_start(&self, application: &str, module_id: &str, fetcher: &str) {}

    /// `found` is false when the fetcher had nothing for this module.
    fn module_fetch_end(&self, application: &str, module_id: &str, fetcher: &str, found: bool) {}

    fn module_fetch_failed(
        &self,
        application: &str,
        module_id: &str,
        fetcher: &str,
        error: &dyn Error,
    ) {
    }

    fn zipline_created(&self) {}

    fn zipline_closed(&self) {}
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {}
