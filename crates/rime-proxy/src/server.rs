use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rime_types::PackageName;

use crate::classify::{classify, Disposition};
use crate::{strip, ProxyContext};

type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Accept connections until `shutdown` fires. Each connection is served on
/// its own task; in-flight strip and prefetch work is tracked on the
/// context and drained separately during shutdown.
pub async fn serve(
    listener: TcpListener,
    context: Arc<ProxyContext>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        let (socket, peer) = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let socket = TokioIo::new(socket);
            let service = service_fn(move |request| handle(Arc::clone(&context), request));
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(socket, service)
                .await
            {
                debug!("Connection from {peer} ended: {err}");
            }
        });
    }
}

async fn handle(
    context: Arc<ProxyContext>,
    request: Request<Incoming>,
) -> Result<Response<ResponseBody>, Infallible> {
    let request_id = format!("{:08x}", fastrand::u32(..));
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let outcome = match classify(&method, &path) {
        Disposition::Health => Ok(plain(StatusCode::OK, "ok")),
        Disposition::Invalid(err) => {
            debug!("[{request_id}] Rejecting {method} {path}: {err}");
            Ok(plain(StatusCode::NOT_FOUND, "Not Found"))
        }
        Disposition::Metadata(name) => metadata(&context, &name, request.headers()).await,
        Disposition::Passthrough => passthrough(&context, request).await,
    };

    Ok(outcome.unwrap_or_else(|err| match err {
        HandlerError::Upstream(err) => {
            warn!("[{request_id}] Upstream request for {method} {path} failed: {err}");
            plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
        HandlerError::Io(err) => {
            warn!("[{request_id}] {method} {path} failed: {err}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }))
}

/// Serve a metadata lookup: from disk when cached, otherwise streamed
/// through from upstream while a copy is buffered for the strip pipeline.
async fn metadata(
    context: &Arc<ProxyContext>,
    name: &PackageName,
    headers: &HeaderMap,
) -> Result<Response<ResponseBody>, HandlerError> {
    if let Some(bytes) = context.store.get(name).await? {
        debug!("Cache hit for {name}");
        context.stats.record_hit(name, bytes.len() as u64).await;
        let length = bytes.len();
        let mut response = Response::new(full(bytes));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(length));
        return Ok(response);
    }

    let started = Instant::now();
    let upstream = context
        .client
        .packument_stream(name, headers)
        .await
        .map_err(HandlerError::Upstream)?;
    debug!("Cache miss for {name}; streaming from upstream");

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let encoding = upstream_headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let cacheable = status.is_success();

    // Drive the upstream body from its own task: the bytes tee into the
    // client response and into a buffer for the strip pipeline, and the
    // transfer runs to completion even if the client goes away.
    let (sender, receiver) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(16);
    let task_context = Arc::clone(context);
    let task_name = name.clone();
    context.tasks.spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut buffered = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    buffered.extend_from_slice(&bytes);
                    let _ = sender.send(Ok(Frame::data(bytes))).await;
                }
                Err(err) => {
                    warn!("Upstream body for {task_name} failed mid-stream: {err}");
                    let _ = sender
                        .send(Err(io::Error::new(io::ErrorKind::Other, err)))
                        .await;
                    return;
                }
            }
        }
        drop(sender);

        if !cacheable {
            debug!("Upstream answered {status} for {task_name}; nothing to cache");
            return;
        }
        let elapsed = started.elapsed().as_millis() as u64;
        task_context
            .stats
            .record_miss(&task_name, buffered.len() as u64, elapsed)
            .await;
        strip::enqueue(&task_context, task_name, buffered, encoding);
    });

    let mut response = Response::new(StreamBody::new(ReceiverStream::new(receiver)).boxed_unsync());
    *response.status_mut() = status;
    for (key, value) in &upstream_headers {
        if key != &TRANSFER_ENCODING {
            response.headers_mut().append(key, value.clone());
        }
    }
    Ok(response)
}

/// Forward a request verbatim, streaming the body in both directions and
/// replaying the upstream status and headers.
async fn passthrough(
    context: &Arc<ProxyContext>,
    request: Request<Incoming>,
) -> Result<Response<ResponseBody>, HandlerError> {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    debug!("Passing through {} {path_and_query}", parts.method);

    let outgoing = if parts.method == Method::GET || parts.method == Method::HEAD {
        None
    } else {
        let stream = BodyStream::new(body).filter_map(|frame| async move {
            match frame {
                Ok(frame) => frame.into_data().ok().map(Ok),
                Err(err) => Some(Err(err)),
            }
        });
        Some(reqwest::Body::wrap_stream(stream))
    };

    let upstream = context
        .client
        .forward(parts.method.clone(), &path_and_query, &parts.headers, outgoing)
        .await
        .map_err(HandlerError::Upstream)?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let elapsed = started.elapsed().as_millis() as u64;
    context
        .stats
        .record_passthrough(parts.uri.path(), elapsed)
        .await;

    let stream = upstream.bytes_stream().map(|chunk| {
        chunk
            .map(Frame::data)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    });
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    for (key, value) in &upstream_headers {
        if key != &TRANSFER_ENCODING {
            response.headers_mut().append(key, value.clone());
        }
    }
    Ok(response)
}

#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error(transparent)]
    Upstream(rime_client::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn plain(status: StatusCode, message: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(full(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
