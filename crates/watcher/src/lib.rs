//! Abstract interface for policy-change watchers.
//!
//! A watcher keeps multiple instances of a policy-enforcement engine in
//! sync: after mutating policy, an instance calls one of the `update_for_*`
//! operations, which publishes a change notification to every other
//! instance watching the same destination. Receiving instances invoke the
//! callback installed via [`Watcher::set_update_callback`] and are expected
//! to reload their policy state in response.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

/// Marker trait for `Watcher` errors
pub trait WatcherError: Debug + Error + Send + Sync + 'static {}

/// Callback invoked with the raw notification payload whenever a change
/// notification arrives. Installed via [`Watcher::set_update_callback`].
pub type UpdateCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Produces a change-event payload: the current UNIX time in seconds as a
/// decimal string. The payload is opaque to subscribers; its only purpose is
/// to be non-empty and vaguely human-readable in broker tooling.
#[must_use]
pub fn timestamp_event() -> Bytes {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Bytes::from(now.as_secs_f64().to_string())
}

/// A trait representing a policy-change watcher with asynchronous
/// operations.
///
/// The `update_for_*` convenience operations all forward to [`update`]; they
/// exist so the policy engine can call a semantically named method after
/// each kind of mutation. Each results in exactly one published
/// notification.
///
/// [`update`]: Watcher::update
#[async_trait]
pub trait Watcher: Send + Sync + 'static {
    /// The error type for watcher operations.
    type Error: WatcherError + Send + Sync + 'static;

    /// Installs the callback invoked for every received change
    /// notification, replacing any previously installed one.
    ///
    /// Installation is atomic with respect to invocation: a callback is
    /// never observed half-written by the delivery loop.
    async fn set_update_callback(&self, callback: UpdateCallback) -> Result<(), Self::Error>;

    /// Publishes a single change notification to the destination.
    ///
    /// Returns once the underlying client accepts the send; delivery to any
    /// subscriber is not confirmed.
    async fn update(&self) -> Result<(), Self::Error>;

    /// Closes the watcher, releasing its broker resources and stopping
    /// delivery. A subsequent [`update`](Watcher::update) on the same
    /// instance fails.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Publishes a change notification after a policy rule was added.
    async fn update_for_add_policy(
        &self,
        section: &str,
        ptype: &str,
        params: &[&str],
    ) -> Result<(), Self::Error> {
        info!(section, ptype, ?params, "update for add policy");
        self.update().await
    }

    /// Publishes a change notification after a policy rule was removed.
    async fn update_for_remove_policy(
        &self,
        section: &str,
        ptype: &str,
        params: &[&str],
    ) -> Result<(), Self::Error> {
        info!(section, ptype, ?params, "update for remove policy");
        self.update().await
    }

    /// Publishes a change notification after rules matching a filter were
    /// removed.
    async fn update_for_remove_filtered_policy(
        &self,
        section: &str,
        ptype: &str,
        field_index: usize,
        params: &[&str],
    ) -> Result<(), Self::Error> {
        info!(
            section,
            ptype, field_index, ?params,
            "update for remove filtered policy"
        );
        self.update().await
    }

    /// Publishes a change notification after a full policy save.
    ///
    /// Takes the rendered model text rather than a model type so the
    /// watcher stays decoupled from the policy engine.
    async fn update_for_save_policy(&self, model: &str) -> Result<(), Self::Error> {
        info!(model, "update for save policy");
        self.update().await
    }

    /// Publishes a change notification after a batch of rules was added.
    async fn update_for_add_policies(
        &self,
        section: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<(), Self::Error> {
        info!(section, ptype, ?rules, "update for add policies");
        self.update().await
    }

    /// Publishes a change notification after a batch of rules was removed.
    async fn update_for_remove_policies(
        &self,
        section: &str,
        ptype: &str,
        rules: &[Vec<String>],
    ) -> Result<(), Self::Error> {
        info!(section, ptype, ?rules, "update for remove policies");
        self.update().await
    }
}
