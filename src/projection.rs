/// Variable projection and status reporting
///
/// The server mirrors coil values, latched levels and listener connectivity
/// into an external key/value surface owned by the host. Publication is
/// fire-and-forget: implementations must not block and the server never
/// looks at the outcome.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

/// Key carrying listener connectivity
pub const CONNECTED_KEY: &str = "server_connected";

/// Key for the raw value of coil `index`
pub fn coil_key(index: usize) -> String {
    format!("coil_{}", index)
}

/// Key for the latched level of coil `index`
pub fn level_key(index: usize) -> String {
    format!("coil_{}_level", index)
}

/// A single key/value change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableUpdate {
    pub key: String,
    pub value: bool,
}

impl VariableUpdate {
    pub fn new<S: Into<String>>(key: S, value: bool) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn coil(index: usize, value: bool) -> Self {
        Self::new(coil_key(index), value)
    }

    pub fn level(index: usize, value: bool) -> Self {
        Self::new(level_key(index), value)
    }

    pub fn connected(value: bool) -> Self {
        Self::new(CONNECTED_KEY, value)
    }
}

/// Health reported to the host on every lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Ok,
    ConnectionError,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Ok => write!(f, "ok"),
            ServerStatus::ConnectionError => write!(f, "connection_error"),
        }
    }
}

/// Output port towards the host
pub trait VariableProjection: Send + Sync {
    /// Publish a batch of changed values
    fn publish(&self, updates: &[VariableUpdate]);

    /// Report server health, with an optional human readable reason
    fn report_status(&self, status: ServerStatus, message: Option<&str>) {
        let _ = (status, message);
    }
}

impl<T> VariableProjection for Arc<T>
where
    T: VariableProjection + ?Sized,
{
    fn publish(&self, updates: &[VariableUpdate]) {
        (**self).publish(updates)
    }

    fn report_status(&self, status: ServerStatus, message: Option<&str>) {
        (**self).report_status(status, message)
    }
}

/// Projection that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProjection;

impl VariableProjection for NullProjection {
    fn publish(&self, _updates: &[VariableUpdate]) {}
}

/// Projection that writes every change to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProjection;

impl VariableProjection for LogProjection {
    fn publish(&self, updates: &[VariableUpdate]) {
        for update in updates {
            debug!("variable {} = {}", update.key, update.value);
        }
    }

    fn report_status(&self, status: ServerStatus, message: Option<&str>) {
        match (status, message) {
            (ServerStatus::Ok, _) => info!("status: {}", status),
            (ServerStatus::ConnectionError, Some(reason)) => warn!("status: {} ({})", status, reason),
            (ServerStatus::ConnectionError, None) => warn!("status: {}", status),
        }
    }
}

/// Callback type receiving published variable batches
pub type PublishCallback = Box<dyn Fn(&[VariableUpdate]) + Send + Sync>;

/// Callback type receiving status reports
pub type StatusCallback = Box<dyn Fn(ServerStatus, Option<&str>) + Send + Sync>;

/// Projection forwarding to host supplied closures
#[derive(Clone, Default)]
pub struct CallbackProjection {
    on_publish: Option<Arc<PublishCallback>>,
    on_status: Option<Arc<StatusCallback>>,
}

impl CallbackProjection {
    pub fn new(on_publish: Option<PublishCallback>, on_status: Option<StatusCallback>) -> Self {
        Self {
            on_publish: on_publish.map(Arc::new),
            on_status: on_status.map(Arc::new),
        }
    }
}

impl VariableProjection for CallbackProjection {
    fn publish(&self, updates: &[VariableUpdate]) {
        if updates.is_empty() {
            return;
        }
        if let Some(ref callback) = self.on_publish {
            callback(updates);
        }
    }

    fn report_status(&self, status: ServerStatus, message: Option<&str>) {
        if let Some(ref callback) = self.on_status {
            callback(status, message);
        }
    }
}

impl fmt::Debug for CallbackProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackProjection")
            .field("on_publish", &self.on_publish.is_some())
            .field("on_status", &self.on_status.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_keys() {
        assert_eq!(VariableUpdate::coil(3, true).key, "coil_3");
        assert_eq!(VariableUpdate::level(3, true).key, "coil_3_level");
        assert_eq!(VariableUpdate::connected(false).key, "server_connected");
    }

    #[test]
    fn test_callback_projection_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));

        let seen_cb = seen.clone();
        let statuses_cb = statuses.clone();
        let projection = CallbackProjection::new(
            Some(Box::new(move |updates: &[VariableUpdate]| {
                seen_cb.lock().unwrap().extend_from_slice(updates);
            })),
            Some(Box::new(move |status, message: Option<&str>| {
                statuses_cb
                    .lock()
                    .unwrap()
                    .push((status, message.map(str::to_string)));
            })),
        );

        projection.publish(&[]);
        projection.publish(&[VariableUpdate::coil(0, true)]);
        projection.report_status(ServerStatus::ConnectionError, Some("bind failed"));

        assert_eq!(*seen.lock().unwrap(), vec![VariableUpdate::coil(0, true)]);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![(ServerStatus::ConnectionError, Some("bind failed".to_string()))]
        );
    }
}
