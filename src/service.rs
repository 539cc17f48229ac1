// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Service Lifecycle
//!
//! Start/stop contract consumed by the application supervisor. A service goes
//! Idle → Running → Stopped and never back.

use crate::errors::AmqpError;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A background component with an explicit start and stop.
#[async_trait]
pub trait Service: Send + Sync {
    /// Launches the background work and returns without waiting for it.
    ///
    /// Cancelling `parent` has the same effect as calling `stop`.
    async fn start(&self, parent: &CancellationToken) -> Result<(), AmqpError>;

    /// Cancels the background work and waits for it to wind down.
    async fn stop(&self) -> Result<(), AmqpError>;
}

/// Lifecycle state shared by the producer and the consumer.
///
/// `T` is whatever the background task takes ownership of when it starts.
pub(crate) enum Lifecycle<T> {
    Idle(T),
    Running {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

impl<T> Lifecycle<T> {
    /// Moves to Running, handing the idle payload and a child token of
    /// `parent` to `spawn`.
    pub(crate) fn start<F>(&mut self, parent: &CancellationToken, spawn: F) -> Result<(), AmqpError>
    where
        F: FnOnce(T, CancellationToken) -> JoinHandle<()>,
    {
        match std::mem::replace(self, Lifecycle::Stopped) {
            Lifecycle::Idle(payload) => {
                let cancel = parent.child_token();
                let task = spawn(payload, cancel.clone());
                *self = Lifecycle::Running { cancel, task };
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                *self = running;
                Err(AmqpError::AlreadyStarted)
            }
            Lifecycle::Stopped => Err(AmqpError::Stopped),
        }
    }

    /// Moves to Stopped, waiting for the background task if one is running.
    pub(crate) async fn stop(&mut self) -> Result<(), AmqpError> {
        let Lifecycle::Running { cancel, task } = std::mem::replace(self, Lifecycle::Stopped)
        else {
            return Ok(());
        };

        cancel.cancel();
        match task.await {
            Ok(()) => {
                debug!("background task finished");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "background task failed");
                Err(AmqpError::InternalError(err.to_string()))
            }
        }
    }

    pub(crate) fn idle_mut(&mut self) -> Option<&mut T> {
        match self {
            Lifecycle::Idle(payload) => Some(payload),
            _ => None,
        }
    }
}
