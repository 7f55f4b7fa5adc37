//! C3: the chunked-upload handler, implementing the three-state session FSM
//! from §4.3 (NEW / PARTIAL / COMPLETE).

use super::Context;
use crate::auth::User;
use crate::error::Error;
use crate::logging::event;
use crate::session::UploadIdentifier;
use crate::storage::{ContentRange, StoreOutcome};
use bytes::Bytes;
use futures::Stream;
use http::{Response, StatusCode};
use slog::{error, info, o, warn, Logger};
use warp::reply::Response as WarpResponse;

fn incomplete_response(uploaded: u64) -> WarpResponse {
    let mut builder = Response::builder().status(StatusCode::from_u16(308).unwrap());
    if uploaded > 0 {
        builder = builder.header("Range", format!("bytes=0-{}", uploaded - 1));
    }
    builder
        .header("Content-Length", "0")
        .body(hyper::Body::empty())
        .expect("building a static response never fails")
}

fn created_response() -> WarpResponse {
    Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Length", "0")
        .body(hyper::Body::empty())
        .expect("building a static response never fails")
}

pub async fn handle<S, E>(
    upload_id: UploadIdentifier,
    range: ContentRange,
    body: S,
    user: User,
    ctx: Context,
    logger: Logger,
) -> Result<WarpResponse, Error>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    let logger = logger.new(o!(
        event::UPLOAD_ID => upload_id.to_string(),
        event::IDENTITY => user.id.clone(),
    ));

    if range.total > ctx.config.measurement_payload_limit_bytes {
        ctx.sessions.remove(&upload_id);
        ctx.storage.clean(upload_id).await?;
        ctx.metrics.uploads_finished.with_label_values(&["payload_too_large"]).inc();
        return Err(Error::PayloadTooLarge {
            declared: range.total,
            limit: ctx.config.measurement_payload_limit_bytes,
        });
    }

    let session = ctx.sessions.get(&upload_id).ok_or_else(|| {
        warn!(logger, "chunk PUT against unknown or expired session");
        Error::SessionExpired
    })?;

    // Serializes appends to this session's chunk (§5 "Ordering guarantees").
    let _append_guard = session.append_lock.lock().await;

    let current_size = ctx.storage.bytes_uploaded(upload_id).await?;

    match current_size {
        None if range.from == 0 => {}
        None => {
            ctx.sessions.remove(&upload_id);
            warn!(logger, "resume attempted against a session with no chunk file");
            return Err(Error::UnexpectedContentRange);
        }
        Some(size) if range.from == size => {}
        Some(size) if range.from == 0 => {
            warn!(logger, "client restarted an upload the server already has bytes for"; "server_size" => size);
            return Err(Error::UnexpectedContentRange);
        }
        Some(size) => {
            info!(logger, "chunk offset mismatch, reporting resume point"; "server_size" => size, "client_from" => range.from);
            return Ok(incomplete_response(size));
        }
    }

    let outcome = ctx.storage.append(upload_id, &range, body).await?;
    ctx.metrics.bytes_received.inc_by(range.body_len());

    match outcome {
        StoreOutcome::Incomplete { size } => Ok(incomplete_response(size)),
        StoreOutcome::Complete { size } => {
            if size != range.total {
                error!(logger, "chunk file size did not match declared total after a complete write";
                    "written" => size, "declared" => range.total);
                return Err(Error::ContentRangeNotMatchingFileSize { written: size, declared: range.total });
            }

            match ctx.storage.commit(upload_id, &session.uploadable, &user.id).await {
                Ok(()) => {
                    ctx.sessions.remove(&upload_id);
                    ctx.metrics.active_sessions.set(ctx.sessions.len() as i64);
                    ctx.metrics.uploads_finished.with_label_values(&["completed"]).inc();
                    info!(logger, "upload committed");
                    Ok(created_response())
                }
                Err(Error::Duplicate) => {
                    ctx.sessions.remove(&upload_id);
                    ctx.metrics.uploads_finished.with_label_values(&["duplicate"]).inc();
                    Err(Error::Duplicate)
                }
                Err(error) => {
                    // Session and chunk are retained; the client can retry.
                    Err(error)
                }
            }
        }
    }
}
