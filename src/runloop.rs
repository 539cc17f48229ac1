// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Loop
//!
//! Shared by the producer and the consumer. Each turn dials a session, lends
//! it to a `SessionHandler`, closes it once the handler returns and sleeps a
//! fixed interval before the next turn. Dial failures are handed to the
//! handler too, so it can report them; nothing here is fatal. The loop ends
//! when the lifetime token is cancelled or the handler asks not to redial.

use crate::{
    channel::{Connector, Session},
    errors::AmqpError,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default pause between two session attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// One generation of work on a session.
#[async_trait]
pub(crate) trait SessionHandler: Send {
    /// Runs until the session is lost or `cancel` fires. When `session` is
    /// `Ok` the handler owns it until it returns.
    ///
    /// Returns whether the loop should redial.
    async fn handle(
        &mut self,
        cancel: &CancellationToken,
        session: Result<Arc<dyn Session>, AmqpError>,
    ) -> bool;
}

pub(crate) async fn run_loop<H: SessionHandler>(
    connector: Arc<dyn Connector>,
    interval: Duration,
    cancel: CancellationToken,
    mut handler: H,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        debug!("connecting");
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            session = connector.connect() => session,
        };

        let healthy = session.as_ref().ok().cloned();
        let redial = handler.handle(&cancel, session).await;

        if let Some(session) = healthy {
            session.close().await;
            debug!("session closed");
        }

        if !redial {
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!("reconnect loop finished");
}
