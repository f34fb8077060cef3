use crate::origin::{strip_hop_by_hop, upstream_uri, HttpClient};
use crate::stats::record_outcome;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{request, HeaderMap, HeaderValue, Request, Response, StatusCode};
use bytes::Bytes;
use cachefront::headers::X_FORWARDED_PROTO;
use cachefront::{
    CacheFilter, Downstream, FilterConfig, FilterHeadersStatus, HttpCache, MemoryStore, Origin,
    RequestHeaders, ResponseHeaders, SharedCache, StreamClosed, StreamInfo, TaskRegistry,
};
use http_body_util::StreamBody;
use hyper::body::{Body as _, Frame};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

const FRAME_BUFFER: usize = 8;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub filter_config: ArcSwap<FilterConfig>,
    /// `None` when caching is disabled; every request is then forwarded.
    pub cache: Option<Arc<SharedCache>>,
    pub store: Arc<MemoryStore>,
    pub origin: Arc<dyn Origin>,
    pub client: HttpClient,
    pub upstream_url: String,
    pub tasks: TaskRegistry,
    /// Time allowed until the response headers are sent. A body already
    /// streaming is not cut.
    pub timeout: Duration,
    pub started: Instant,
}

/// Main proxy handler. Runs the cache filter for the request and answers
/// with whatever it encodes; requests the filter passes on are forwarded
/// to the upstream untouched.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let end_stream = body.is_end_stream();

    let mut request = RequestHeaders::new(parts.method.clone(), parts.uri.clone());
    request.headers = parts.headers.clone();
    if !request.headers.contains_key(X_FORWARDED_PROTO) {
        request
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    let filter = CacheFilter::new(
        state.filter_config.load_full(),
        state.cache.clone().map(|c| c as Arc<dyn HttpCache>),
        Arc::clone(&state.origin),
        state.tasks.clone(),
    );
    let (reply_tx, reply_rx) = oneshot::channel();
    let downstream = ChannelDownstream::new(reply_tx);
    tokio::spawn(run_filter(filter, downstream, request, end_stream, state.timeout));

    match reply_rx.await {
        Ok(Reply::Response(response)) => response,
        Ok(Reply::PassThrough) => forward(&state, parts, body).await,
        Err(_) => local_reply(StatusCode::SERVICE_UNAVAILABLE, "upstream_reset"),
    }
}

async fn run_filter(
    mut filter: CacheFilter,
    mut downstream: ChannelDownstream,
    request: RequestHeaders,
    end_stream: bool,
    timeout: Duration,
) {
    let start = Instant::now();
    let uri = request.uri.clone();
    let answered = downstream.answered();

    let outcome = tokio::select! {
        status = filter.decode_headers(request, end_stream, &mut downstream) => Some(status),
        _ = headers_deadline(timeout, answered) => None,
    };
    let status = match outcome {
        Some(status) => status,
        None => {
            tracing::warn!(uri = %uri, timeout_ms = timeout.as_millis(), "request timed out");
            filter.on_local_reply(StatusCode::REQUEST_TIMEOUT);
            downstream
                .send_local_reply(StatusCode::REQUEST_TIMEOUT, "request_timeout")
                .await;
            FilterHeadersStatus::StopIteration
        }
    };
    if status == FilterHeadersStatus::Continue {
        downstream.pass_through();
    }

    filter.on_stream_complete(downstream.stream_info_mut());
    if let Some(info) = downstream.info.cache_logging {
        record_outcome(&info);
        tracing::debug!(
            uri = %uri,
            lookup = info.lookup_status.as_str(),
            insert = info.insert_status.as_str(),
            from_cache = downstream.info.response_from_cache,
            latency_us = start.elapsed().as_micros(),
            "request complete"
        );
    }
}

/// Resolves once `timeout` passes without the handler being answered.
async fn headers_deadline(timeout: Duration, answered: oneshot::Receiver<()>) {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {}
        _ = answered => std::future::pending::<()>().await,
    }
}

/// Forward a request the filter does not handle straight through the
/// client, streaming the response back.
async fn forward(state: &AppState, parts: request::Parts, body: Body) -> Response<Body> {
    let uri = match upstream_uri(&state.upstream_url, &parts.uri) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(error = %e, "failed to build upstream request");
            return local_reply(StatusCode::NOT_FOUND, "cache_no_route");
        }
    };

    let mut upstream_req = Request::new(body);
    *upstream_req.method_mut() = parts.method;
    *upstream_req.uri_mut() = uri;
    *upstream_req.headers_mut() = parts.headers;
    strip_hop_by_hop(upstream_req.headers_mut());

    match tokio::time::timeout(state.timeout, state.client.request(upstream_req)).await {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            parts
                .headers
                .insert("x-cache", HeaderValue::from_static("BYPASS"));
            Response::from_parts(parts, Body::new(body))
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, upstream = %state.upstream_url, "upstream request failed");
            local_reply(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
        Err(_) => local_reply(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"),
    }
}

fn local_reply(status: StatusCode, details: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(details));
    *response.status_mut() = status;
    response
}

enum Reply {
    Response(Response<Body>),
    PassThrough,
}

type FrameSender = mpsc::Sender<Result<Frame<Bytes>, io::Error>>;

/// Hands the encoded response to the waiting handler: headers through a
/// oneshot, body and trailers as frames of a streaming body.
struct ChannelDownstream {
    reply: Option<oneshot::Sender<Reply>>,
    answered: Option<oneshot::Sender<()>>,
    body: Option<FrameSender>,
    info: StreamInfo,
}

impl ChannelDownstream {
    fn new(reply: oneshot::Sender<Reply>) -> Self {
        Self {
            reply: Some(reply),
            answered: None,
            body: None,
            info: StreamInfo::default(),
        }
    }

    /// Fires once the handler has its reply.
    fn answered(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.answered = Some(tx);
        rx
    }

    fn reply(&mut self, reply: Reply) -> Result<(), StreamClosed> {
        if let Some(answered) = self.answered.take() {
            let _ = answered.send(());
        }
        let tx = self.reply.take().ok_or(StreamClosed)?;
        tx.send(reply).map_err(|_| StreamClosed)
    }

    fn pass_through(&mut self) {
        if self.reply.is_some() {
            let _ = self.reply(Reply::PassThrough);
        }
    }

    async fn send_frame(&mut self, frame: Frame<Bytes>, end_stream: bool) -> Result<(), StreamClosed> {
        let tx = self.body.as_ref().ok_or(StreamClosed)?;
        tx.send(Ok(frame)).await.map_err(|_| StreamClosed)?;
        if end_stream {
            self.body = None;
        }
        Ok(())
    }
}

#[async_trait]
impl Downstream for ChannelDownstream {
    async fn encode_headers(&mut self, headers: ResponseHeaders, end_stream: bool) -> Result<(), StreamClosed> {
        let body = if end_stream {
            Body::empty()
        } else {
            let (tx, rx) = mpsc::channel(FRAME_BUFFER);
            self.body = Some(tx);
            let frames = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            });
            Body::new(StreamBody::new(frames))
        };

        let mut response = Response::new(body);
        *response.status_mut() = headers.status;
        *response.headers_mut() = headers.headers;
        let cache_status = if self.info.response_from_cache { "HIT" } else { "MISS" };
        response
            .headers_mut()
            .insert("x-cache", HeaderValue::from_static(cache_status));

        let sent = self.reply(Reply::Response(response));
        if sent.is_err() {
            self.body = None;
        }
        sent
    }

    async fn encode_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), StreamClosed> {
        self.send_frame(Frame::data(data), end_stream).await
    }

    async fn encode_trailers(&mut self, trailers: HeaderMap) -> Result<(), StreamClosed> {
        self.send_frame(Frame::trailers(trailers), true).await
    }

    async fn send_local_reply(&mut self, status: StatusCode, details: &'static str) {
        self.info.response_code_details = Some(details.to_string());
        if self.reply.is_some() {
            let _ = self.reply(Reply::Response(local_reply(status, details)));
        } else {
            self.reset_stream();
        }
    }

    fn reset_stream(&mut self) {
        if let Some(tx) = self.body.take() {
            let _ = tx.try_send(Err(io::Error::other("stream reset")));
        }
        self.reply = None;
    }

    fn stream_info_mut(&mut self) -> &mut StreamInfo {
        &mut self.info
    }
}
