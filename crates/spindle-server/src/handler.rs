//! Request handler for spindle-server.
//!
//! Routes JSON-RPC requests to the shared connection.

use crate::protocol::{error_codes, EvalParams, Request, Response};
use serde_json::json;
use spindle_core::{Connection, CorrelationId, Requester, SubmitError};
use tracing::{debug, trace, warn};

/// Handle a JSON-RPC request.
///
/// Returns the response when it is known immediately, or `None` when the
/// command was queued and its reply will arrive through `requester`.
///
/// Supported methods:
/// - `ping` - Health check, returns `{pong: true}`.
/// - `stats` - Connection counters and worker state.
/// - `open` - Create the script context.
/// - `close` - Destroy the script context.
/// - `eval` - Evaluate `params.source`.
///
/// Any other method is queued as an invalid command and answered in order.
pub fn handle_request(conn: &Connection, requester: &Requester, req: Request) -> Option<Response> {
    debug!(method = %req.method, id = req.id, "handling request");
    trace!(params = ?req.params, "request params");

    let id = CorrelationId::from(req.id);
    let submitted = match req.method.as_str() {
        "ping" => return Some(Response::success(req.id, json!({"pong": true}))),

        "stats" => return Some(handle_stats(req.id, conn)),

        "open" => conn.open(id, requester.clone()),

        "close" => conn.close(id, requester.clone()),

        "eval" => match serde_json::from_value::<EvalParams>(req.params) {
            Ok(p) => conn.eval(id, requester.clone(), &p.source),
            Err(e) => {
                warn!(id = req.id, error = %e, "invalid eval params");
                return Some(Response::error(
                    req.id,
                    error_codes::INVALID_PARAMS,
                    format!("invalid params: {}", e),
                ));
            }
        },

        other => {
            warn!(method = %other, "unknown method, forwarding as invalid command");
            conn.submit_named(other, id, requester.clone(), None)
        }
    };

    match submitted {
        Ok(()) => {
            trace!(id = req.id, "command queued");
            None
        }
        Err(e) => Some(rejected(req.id, &e)),
    }
}

fn handle_stats(id: u64, conn: &Connection) -> Response {
    Response::success(
        id,
        json!({
            "connection_id": conn.id().to_string(),
            "started_at": conn.started_at().to_rfc3339(),
            "worker_state": conn.worker_state().to_string(),
            "accepting": conn.is_accepting(),
            "pending": conn.pending(),
            "counters": conn.stats().snapshot(),
        }),
    )
}

fn rejected(id: u64, err: &SubmitError) -> Response {
    debug!(id, error = %err, "command rejected");
    Response::rejected(id, err)
}
