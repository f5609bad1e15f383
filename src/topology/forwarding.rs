/*!
Forwarding-table collaborator.

`ForwardingPlane` is what route consolidation pushes its results into. Two
implementations ship with the crate: `ChannelForwarder` hands every update to
a bounded channel (a RIB client or a test reads the other end) and
`LoggingForwarder` only logs.
*/

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::topology::routing_table::{RouteDiff, RouteEntry};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardingError {
    #[error("forwarding plane unavailable: {0}")]
    Unavailable(String),
    #[error("route {prefix} rejected: {reason}")]
    Rejected { prefix: Ipv4Network, reason: String },
}

#[async_trait]
pub trait ForwardingPlane: Send + Sync {
    /// Adds or replaces the route for `route.prefix`.
    async fn install_route(&self, route: &RouteEntry) -> Result<(), ForwardingError>;

    async fn withdraw_route(&self, route: &RouteEntry) -> Result<(), ForwardingError>;
}

/// Pushes a route diff, withdrawals first, and returns the part the
/// forwarding plane accepted. Failures are logged and skipped so one rejected
/// route never blocks the rest.
pub async fn apply_route_diff(forwarder: &dyn ForwardingPlane, diff: &RouteDiff) -> RouteDiff {
    let mut applied = RouteDiff::default();
    for route in &diff.withdrawals {
        match forwarder.withdraw_route(route).await {
            Ok(()) => applied.withdrawals.push(route.clone()),
            Err(e) => warn!(prefix = %route.prefix, error = %e, "route withdraw failed"),
        }
    }
    for route in &diff.installs {
        match forwarder.install_route(route).await {
            Ok(()) => applied.installs.push(route.clone()),
            Err(e) => warn!(prefix = %route.prefix, error = %e, "route install failed"),
        }
    }
    applied
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteUpdate {
    Install(RouteEntry),
    Withdraw(RouteEntry),
}

/// Forwards every update over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelForwarder {
    tx: mpsc::Sender<RouteUpdate>,
}

impl ChannelForwarder {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RouteUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn send(&self, update: RouteUpdate) -> Result<(), ForwardingError> {
        self.tx
            .send(update)
            .await
            .map_err(|_| ForwardingError::Unavailable("route update receiver dropped".to_string()))
    }
}

#[async_trait]
impl ForwardingPlane for ChannelForwarder {
    async fn install_route(&self, route: &RouteEntry) -> Result<(), ForwardingError> {
        self.send(RouteUpdate::Install(route.clone())).await
    }

    async fn withdraw_route(&self, route: &RouteEntry) -> Result<(), ForwardingError> {
        self.send(RouteUpdate::Withdraw(route.clone())).await
    }
}

/// Used when no RIB client is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingForwarder;

#[async_trait]
impl ForwardingPlane for LoggingForwarder {
    async fn install_route(&self, route: &RouteEntry) -> Result<(), ForwardingError> {
        let next_hops: Vec<String> = route.next_hops.iter().map(ToString::to_string).collect();
        info!(prefix = %route.prefix, class = %route.class, cost = route.cost, next_hops = ?next_hops, "install route");
        Ok(())
    }

    async fn withdraw_route(&self, route: &RouteEntry) -> Result<(), ForwardingError> {
        info!(prefix = %route.prefix, "withdraw route");
        Ok(())
    }
}
