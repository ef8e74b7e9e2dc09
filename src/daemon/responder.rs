//! Request handler for the loopback service

use tokio::sync::mpsc;

use crate::common::{Error, Result};
use crate::ipc::{ClientMessage, RequestHandler, Responder, ServerMessage};

/// `result` reported for opcodes the service does not understand
pub const INVALID_REQUEST_RESULT: u32 = u32::MAX;

/// Answers each request with its natural reply code, echoing `data`
///
/// Notifications (requests without a reply code) are only logged. A
/// malformed request is skipped; any other receive failure is forwarded
/// once so the daemon can shut down.
pub struct LoopbackResponder {
    handled: u64,
    failures: Option<mpsc::UnboundedSender<Error>>,
}

impl LoopbackResponder {
    pub fn new(failures: mpsc::UnboundedSender<Error>) -> Self {
        Self {
            handled: 0,
            failures: Some(failures),
        }
    }

    /// The response for `request`, if it gets one
    pub fn reply(request: &ClientMessage) -> Option<ServerMessage> {
        let code = request.code.reply_code()?;
        let reply = ServerMessage::reply_to(request, code).with_data(request.data);
        if request.code.is_known() {
            Some(reply)
        } else {
            Some(reply.with_result(INVALID_REQUEST_RESULT))
        }
    }
}

impl RequestHandler for LoopbackResponder {
    fn on_request(&mut self, request: Result<ClientMessage>, responder: &Responder) {
        let request = match request {
            Ok(request) => request,
            Err(e @ Error::MalformedFrame { .. }) => {
                tracing::warn!(error = %e, "Ignoring malformed request");
                return;
            }
            Err(e) => {
                if let Some(failures) = self.failures.take() {
                    let _ = failures.send(e);
                }
                return;
            }
        };

        self.handled += 1;
        tracing::debug!(
            key = %request.routing_key,
            code = %request.code,
            seq = request.seq_id,
            device = request.device_id,
            "Request received"
        );

        let Some(reply) = Self::reply(&request) else {
            tracing::trace!(code = %request.code, "Notification, no reply");
            return;
        };
        if !request.code.is_known() {
            tracing::warn!(key = %request.routing_key, code = %request.code, "Unknown request code");
        }

        if let Err(e) = responder.send(&reply) {
            tracing::warn!(key = %request.routing_key, error = %e, "Failed to send reply");
        }
    }
}

impl Drop for LoopbackResponder {
    fn drop(&mut self) {
        tracing::info!(handled = self.handled, "Loopback responder finished");
    }
}
