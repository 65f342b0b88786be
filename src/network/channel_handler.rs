use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::TransportConf;
use crate::network::client::TransportClient;
use crate::network::protocol::Frame;
use crate::network::request_handler::RequestMessageHandler;
use crate::network::response_handler::TransportResponseHandler;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum IdleOutcome {
    NoAction,
    /// requests were outstanding for too long, the connection was closed as dead
    TimedOut,
    /// the connection had nothing outstanding and was closed to reclaim it
    ClosedIdle,
}

/// The lifecycle handler of one connection. The connection's driver calls it strictly
///  sequentially: activation, each frame in arrival order, idle signals and faults, and finally
///  deactivation.
pub struct TransportChannelHandler {
    client: Arc<TransportClient>,
    request_handler: Arc<dyn RequestMessageHandler>,
    response_handler: Arc<TransportResponseHandler>,
    request_timeout: Duration,
    close_idle_connections: bool,
}

impl TransportChannelHandler {
    pub fn new(
        client: Arc<TransportClient>,
        request_handler: Arc<dyn RequestMessageHandler>,
        response_handler: Arc<TransportResponseHandler>,
        conf: &TransportConf,
    ) -> TransportChannelHandler {
        TransportChannelHandler {
            client,
            request_handler,
            response_handler,
            request_timeout: conf.request_timeout,
            close_idle_connections: conf.close_idle_connections,
        }
    }

    pub fn client(&self) -> &Arc<TransportClient> {
        &self.client
    }

    pub async fn on_active(&self) {
        if let Err(e) = self.request_handler.channel_active().await {
            error!("exception from request handler while channel is active: {:#}", e);
        }
        if let Err(e) = self.response_handler.channel_active().await {
            error!("exception from response handler while channel is active: {:#}", e);
        }
    }

    pub async fn on_inactive(&self) {
        if let Err(e) = self.request_handler.channel_inactive().await {
            error!("exception from request handler while channel is inactive: {:#}", e);
        }
        if let Err(e) = self.response_handler.channel_inactive().await {
            error!("exception from response handler while channel is inactive: {:#}", e);
        }
    }

    /// Routes a frame to the request or response side. Frames this protocol does not know are
    ///  returned unchanged for some outer layer to deal with. An error returned from here is a
    ///  fault of the connection.
    pub async fn on_frame_received(&self, frame: Frame) -> anyhow::Result<Option<Frame>> {
        match frame {
            Frame::Request(request) => {
                self.request_handler.handle(request).await?;
                Ok(None)
            }
            Frame::Response(response) => {
                self.response_handler.handle(response).await?;
                Ok(None)
            }
            unrecognized => {
                trace!("passing on frame with unrecognized tag {}", unrecognized.tag());
                Ok(Some(unrecognized))
            }
        }
    }

    /// Called by the idle detector when no bytes were read or written for the request timeout.
    ///
    /// The decision is taken while holding the response handler's lock, so a request that is
    ///  being recorded concurrently is either fully counted or not sent yet.
    pub async fn on_idle(&self) -> IdleOutcome {
        let now = Instant::now();
        self.response_handler.with_connection_state(|state| {
            if !self.client.is_active() {
                return IdleOutcome::NoAction;
            }

            let is_actually_overdue = match state.time_of_last_request {
                Some(t) => now.saturating_duration_since(t) > self.request_timeout,
                None => true,
            };
            if !is_actually_overdue {
                return IdleOutcome::NoAction;
            }

            if state.outstanding > 0 {
                error!("connection to {} has been quiet for {} ms while there are outstanding requests - assuming connection is dead",
                    self.client.remote_addr(), self.request_timeout.as_millis());
                self.client.time_out();
                self.client.close();
                IdleOutcome::TimedOut
            }
            else if self.close_idle_connections {
                debug!("closing idle connection to {}", self.client.remote_addr());
                self.client.time_out();
                self.client.close();
                IdleOutcome::ClosedIdle
            }
            else {
                IdleOutcome::NoAction
            }
        }).await
    }

    /// Both sides get to clean up, then the connection is closed regardless.
    pub async fn on_fault(&self, cause: &anyhow::Error) {
        warn!("exception in connection from {}: {:#}", self.client.remote_addr(), cause);

        if let Err(e) = self.request_handler.exception_caught(format!("{:#}", cause)).await {
            error!("exception from request handler while handling a fault: {:#}", e);
        }
        if let Err(e) = self.response_handler.exception_caught(cause).await {
            error!("exception from response handler while handling a fault: {:#}", e);
        }
        self.client.close();
    }
}
