//! Polling client proxy for a published service.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;

use fastpipe_core::paths::fastpipe_root;
use fastpipe_core::{registry, Arguments, RequestMessage, ResponseMessage, ServiceRecord};

use crate::error::{FastpipeError, RemoteExecutionError};
use crate::mailbox::{new_message_id, Mailbox};
use crate::server::{deadline_after, expired};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Total time to wait for one response.
    pub timeout: Duration,
    /// First delay between response checks.
    pub poll_interval: Duration,
    /// Ceiling for the growing delay.
    pub backoff_cap: Duration,
    pub backoff_factor: f64,
    /// Constructor arguments sent with every call, for instance-method endpoints.
    pub ctor: Arguments,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(2),
            backoff_cap: Duration::from_millis(20),
            backoff_factor: 1.5,
            ctor: Arguments::new(),
        }
    }
}

impl ClientOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ctor(mut self, ctor: Arguments) -> Self {
        self.ctor = ctor;
        self
    }

    /// Reject a backoff factor that would shrink the delay or is not a number.
    pub fn validate(&self) -> Result<(), FastpipeError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(FastpipeError::InvalidOptions(format!(
                "backoff_factor must be a finite number >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    /// Next delay between response checks, never above `backoff_cap`.
    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .map_or(self.backoff_cap, |next| next.min(self.backoff_cap))
    }
}

/// Connection to one service through its mailbox.
#[derive(Debug)]
pub struct ServiceClient {
    name: String,
    record: ServiceRecord,
    mailbox: Mailbox,
    options: ClientOptions,
    endpoints: Vec<String>,
}

impl ServiceClient {
    /// Resolve `name` under `root` and fetch its endpoint list.
    pub fn connect_at(root: &Path, name: &str, options: ClientOptions) -> Result<Self, FastpipeError> {
        options.validate()?;
        let record = registry::resolve_at(root, name)?;
        let mailbox = Mailbox::open(&record.root).ok_or_else(|| {
            RemoteExecutionError::ServiceUnavailable {
                service: name.to_string(),
                reason: format!("mailbox missing under {}", record.root.display()),
            }
        })?;
        let mut client = Self {
            name: name.to_string(),
            record,
            mailbox,
            options,
            endpoints: Vec::new(),
        };
        client.refresh_endpoints()?;
        tracing::debug!(service = %client.name, endpoints = client.endpoints.len(), "connected");
        Ok(client)
    }

    /// `connect_at` convenience wrapper resolving the root from `FASTPIPE_HOME`.
    pub fn connect(name: &str, options: ClientOptions) -> Result<Self, FastpipeError> {
        Self::connect_at(&fastpipe_root()?, name, options)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Endpoint names fetched at connect time.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.endpoints.iter().any(|e| e == endpoint)
    }

    /// Re-fetch the endpoint list from the service.
    pub fn refresh_endpoints(&mut self) -> Result<&[String], RemoteExecutionError> {
        let response = self.write_request(RequestMessage::list_endpoints())?;
        let value = response.into_result().map_err(|err| RemoteExecutionError::Protocol {
            service: self.name.clone(),
            detail: format!("list_endpoints failed: {err}"),
        })?;
        self.endpoints =
            serde_json::from_value(value).map_err(|err| RemoteExecutionError::Protocol {
                service: self.name.clone(),
                detail: format!("endpoint list is not an array of strings: {err}"),
            })?;
        Ok(&self.endpoints)
    }

    /// Send one request and wait for its response.
    ///
    /// Keeps a caller-assigned `request.id` and assigns a fresh one otherwise.
    /// The wait between checks starts at `poll_interval` and grows by
    /// `backoff_factor` up to `backoff_cap`. A timeout too large to represent
    /// waits forever.
    pub fn write_request(&self, mut request: RequestMessage) -> Result<ResponseMessage, RemoteExecutionError> {
        let id = request.id.clone().unwrap_or_else(new_message_id);
        request.id = Some(id.clone());
        self.mailbox
            .write_request(&id, &request)
            .map_err(|err| self.local_error(err))?;
        tracing::trace!(service = %self.name, request_id = %id, kind = ?request.kind, "request written");

        let deadline = deadline_after(self.options.timeout);
        let mut delay = self.options.poll_interval;
        loop {
            if let Some(bytes) = self
                .mailbox
                .take_response(&id)
                .map_err(|err| self.local_error(err))?
            {
                return serde_json::from_slice(&bytes).map_err(|err| RemoteExecutionError::Protocol {
                    service: self.name.clone(),
                    detail: format!("undecodable response {id}: {err}"),
                });
            }
            if expired(deadline) {
                tracing::debug!(service = %self.name, request_id = %id, "request timed out");
                return Err(RemoteExecutionError::Timeout {
                    service: self.name.clone(),
                    timeout: self.options.timeout,
                });
            }
            let nap = match deadline {
                Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
                None => delay,
            };
            thread::sleep(nap);
            delay = self.options.next_delay(delay);
        }
    }

    /// Call `endpoint` with the client's constructor arguments.
    pub fn invoke(&self, endpoint: &str, call: Arguments) -> Result<Value, RemoteExecutionError> {
        let request = RequestMessage::call(endpoint, call.clone(), self.options.ctor.clone());
        let response = self.write_request(request)?;
        response.into_result().map_err(|err| RemoteExecutionError::Remote {
            service: self.name.clone(),
            endpoint: endpoint.to_string(),
            kind: err.kind,
            message: err.message,
            args: call.args,
            kwargs: call.kwargs,
        })
    }

    /// [`ServiceClient::invoke`] with the result decoded into `T`.
    pub fn call<T: DeserializeOwned>(&self, endpoint: &str, call: Arguments) -> Result<T, RemoteExecutionError> {
        let value = self.invoke(endpoint, call)?;
        serde_json::from_value(value).map_err(|err| RemoteExecutionError::Protocol {
            service: self.name.clone(),
            detail: format!("result of '{endpoint}' has an unexpected shape: {err}"),
        })
    }

    fn local_error(&self, err: FastpipeError) -> RemoteExecutionError {
        match err {
            FastpipeError::Io { path, source } => RemoteExecutionError::Io { path, source },
            FastpipeError::Remote(err) => err,
            other => RemoteExecutionError::Protocol {
                service: self.name.clone(),
                detail: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastpipe_core::NotFoundCause;
    use fastpipe_core::RegistryError;
    use tempfile::TempDir;

    #[test]
    fn connect_to_unknown_service_is_not_found() {
        let root = TempDir::new().expect("root");
        let err = ServiceClient::connect_at(root.path(), "ghost", ClientOptions::default()).unwrap_err();
        assert!(
            matches!(
                err,
                FastpipeError::Registry(RegistryError::NotFound {
                    cause: NotFoundCause::Missing,
                    ..
                })
            ),
            "got: {err}"
        );
    }

    #[test]
    fn connect_without_mailbox_is_unavailable() {
        let root = TempDir::new().expect("root");
        let service_root = root.path().join("services").join("bare");
        std::fs::create_dir_all(&service_root).expect("mkdir");
        let record = ServiceRecord::for_current_process("bare", &service_root);
        registry::register_at(root.path(), &record).expect("register");

        let err = ServiceClient::connect_at(root.path(), "bare", ClientOptions::default()).unwrap_err();
        assert!(
            matches!(err, FastpipeError::Remote(RemoteExecutionError::ServiceUnavailable { .. })),
            "got: {err}"
        );
    }

    #[test]
    fn default_backoff_matches_documented_values() {
        let options = ClientOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.poll_interval, Duration::from_millis(2));
        assert_eq!(options.backoff_cap, Duration::from_millis(20));
        assert!(options.ctor.is_empty());
    }

    #[test]
    fn backoff_factor_below_one_or_nan_is_rejected() {
        let root = TempDir::new().expect("root");
        for factor in [0.5, f64::NAN, f64::INFINITY] {
            let options = ClientOptions {
                backoff_factor: factor,
                ..ClientOptions::default()
            };
            let err = ServiceClient::connect_at(root.path(), "ghost", options).unwrap_err();
            assert!(matches!(err, FastpipeError::InvalidOptions(_)), "got: {err}");
        }
    }

    #[test]
    fn backoff_grows_to_the_cap_without_overflow() {
        let options = ClientOptions {
            backoff_factor: 1e300,
            backoff_cap: Duration::MAX,
            ..ClientOptions::default()
        };
        assert_eq!(options.next_delay(Duration::from_millis(2)), Duration::MAX);

        let options = ClientOptions::default();
        let next = options.next_delay(Duration::from_millis(2));
        assert!(next > Duration::from_millis(2) && next < Duration::from_millis(4), "got {next:?}");
        assert_eq!(options.next_delay(Duration::from_millis(19)), Duration::from_millis(20));
    }
}
