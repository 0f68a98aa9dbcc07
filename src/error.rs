//! Public-boundary error types (§7). Internal plumbing propagates `anyhow::Error`
//! throughout, the same split the teacher draws between its service internals and the
//! handful of error enums its callers are expected to match on.

use thiserror::Error;

use crate::types::Udn;

/// Errors a [`crate::host::DeviceHost`] or [`crate::control_point::ControlPoint`] can
/// return from its lifecycle methods (`init`, `quit`).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid device description: {0}")]
    InvalidDeviceDescription(#[source] anyhow::Error),
    #[error("invalid service description: {0}")]
    InvalidServiceDescription(#[source] anyhow::Error),
    #[error("undefined failure: {0}")]
    UndefinedFailure(#[source] anyhow::Error),
}

/// Errors building a [`crate::model::Device`] tree from a fetched description (§4.4,
/// §8 scenario 2's malformed-description case).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("description did not parse: {0}")]
    Parse(#[source] anyhow::Error),
    #[error("description failed validation: {0}")]
    Validation(#[source] anyhow::Error),
}

/// Errors subscribing to, or renewing a subscription with, a service's eventing URL
/// (§4.5, §4.6).
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("service has no evented state variables, nothing to subscribe to")]
    NothingToSubscribeTo,
    #[error("no subscription found for that id")]
    UnknownSid,
    #[error("subscribe request failed: {0}")]
    Http(#[source] anyhow::Error),
    #[error("state variable mutation is not permitted on this side of the tree")]
    NotPermitted,
}

/// Errors invoking an action, whether local (§4.7) or remote (§4.8).
#[derive(Debug, Error)]
pub enum ActionCallError {
    #[error(transparent)]
    Protocol(#[from] crate::soap::ActionError),
    #[error("network error calling remote action: {0}")]
    Network(#[source] anyhow::Error),
    #[error("device {0} is not reachable from this control point's local subnet")]
    Unreachable(Udn),
    #[error("action invocation timed out")]
    TimedOut,
    #[error("shutting down, no further invocations are accepted")]
    ShuttingDown,
}
