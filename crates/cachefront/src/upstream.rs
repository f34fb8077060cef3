//! One origin round trip on behalf of a filter.
//!
//! The fetch runs as a registered background task and talks to its filter
//! over a channel. Body and trailers go to the insert first, then
//! downstream. When the filter goes away the fetch stops, unless an insert
//! is still being fed, in which case it drains the origin into the cache.

use crate::backend::InsertContext;
use crate::error::OriginError;
use crate::headers::{RequestHeaders, ResponseHeaders};
use crate::tasks::TaskRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use http::HeaderMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Frames of an origin response.
#[derive(Clone, Debug)]
pub enum OriginEvent {
    Headers { headers: ResponseHeaders, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers(HeaderMap),
}

pub type OriginStream = BoxStream<'static, Result<OriginEvent, OriginError>>;

/// Where cache misses and validations are sent.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn send(&self, request: RequestHeaders) -> Result<OriginStream, OriginError>;
}

/// The filter's answer to origin response headers.
pub enum Verdict {
    /// Forward the response, feeding the insert if there is one.
    Forward(Option<Box<dyn InsertContext>>),
    /// The filter answers from cache; stop the origin stream.
    Discard,
}

pub enum UpstreamEvent {
    Headers {
        headers: ResponseHeaders,
        end_stream: bool,
        verdict: oneshot::Sender<Verdict>,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Trailers(HeaderMap),
    /// The cache refused part of the body; the insert is gone.
    InsertAborted,
    /// The origin could not be reached or reset mid-stream.
    Failed(OriginError),
}

const EVENT_BUFFER: usize = 16;

/// Filter-side handle on an origin fetch. Dropping it disconnects.
pub struct UpstreamRequest {
    events: mpsc::Receiver<UpstreamEvent>,
}

impl UpstreamRequest {
    pub fn start(tasks: &TaskRegistry, origin: Arc<dyn Origin>, request: RequestHeaders) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tasks.spawn("upstream", run(origin, request, tx));
        Self { events: rx }
    }

    /// `None` once the fetch has finished.
    pub async fn next_event(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }
}

async fn run(origin: Arc<dyn Origin>, request: RequestHeaders, tx: mpsc::Sender<UpstreamEvent>) {
    let uri = request.uri.clone();
    let mut stream = tokio::select! {
        res = origin.send(request) => match res {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(%uri, error = %e, "origin request failed");
                let _ = tx.send(UpstreamEvent::Failed(e)).await;
                return;
            }
        },
        _ = tx.closed() => {
            tracing::debug!(%uri, "filter went away before the origin answered");
            return;
        }
    };

    let mut downstream = Some(tx);
    let mut insert: Option<Box<dyn InsertContext>> = None;

    loop {
        let next = match (&downstream, &insert) {
            (Some(tx), None) => tokio::select! {
                next = stream.next() => next,
                _ = tx.closed() => {
                    tracing::debug!(%uri, "filter went away, aborting origin stream");
                    return;
                }
            },
            (None, None) => return,
            _ => stream.next().await,
        };

        match next {
            Some(Ok(OriginEvent::Headers { headers, end_stream })) => {
                let Some(tx) = downstream.as_ref() else {
                    return;
                };
                let (verdict_tx, verdict_rx) = oneshot::channel();
                let event = UpstreamEvent::Headers {
                    headers,
                    end_stream,
                    verdict: verdict_tx,
                };
                if tx.send(event).await.is_err() {
                    return;
                }
                match verdict_rx.await {
                    Ok(Verdict::Forward(ins)) => insert = ins,
                    Ok(Verdict::Discard) | Err(_) => return,
                }
                if end_stream {
                    return;
                }
            }
            Some(Ok(OriginEvent::Data { data, end_stream })) => {
                if let Some(ins) = insert.as_mut() {
                    match ins.insert_body(data.clone(), end_stream).await {
                        Ok(()) if end_stream => insert = None,
                        Ok(()) => {}
                        Err(e) => {
                            tracing::warn!(%uri, error = %e, "cache aborted insert");
                            insert = None;
                            notify(&mut downstream, UpstreamEvent::InsertAborted).await;
                        }
                    }
                }
                notify(&mut downstream, UpstreamEvent::Data { data, end_stream }).await;
                if end_stream {
                    return;
                }
            }
            Some(Ok(OriginEvent::Trailers(trailers))) => {
                if let Some(mut ins) = insert.take() {
                    if let Err(e) = ins.insert_trailers(trailers.clone()).await {
                        tracing::warn!(%uri, error = %e, "cache aborted insert at trailers");
                        notify(&mut downstream, UpstreamEvent::InsertAborted).await;
                    }
                }
                notify(&mut downstream, UpstreamEvent::Trailers(trailers)).await;
                return;
            }
            Some(Err(e)) => {
                fail(&uri, insert.take(), &mut downstream, e).await;
                return;
            }
            None => {
                let e = OriginError::Reset("origin stream ended early".to_string());
                fail(&uri, insert.take(), &mut downstream, e).await;
                return;
            }
        }
    }
}

/// Forward to the filter if it is still listening.
async fn notify(downstream: &mut Option<mpsc::Sender<UpstreamEvent>>, event: UpstreamEvent) {
    if let Some(tx) = downstream.as_ref() {
        if tx.send(event).await.is_err() {
            *downstream = None;
        }
    }
}

async fn fail(
    uri: &http::Uri,
    insert: Option<Box<dyn InsertContext>>,
    downstream: &mut Option<mpsc::Sender<UpstreamEvent>>,
    error: OriginError,
) {
    if insert.is_some() {
        tracing::warn!(%uri, error = %error, "origin reset during insert, aborting population");
    } else {
        tracing::debug!(%uri, error = %error, "origin stream reset");
    }
    // Dropping the insert aborts the population.
    drop(insert);
    notify(downstream, UpstreamEvent::Failed(error)).await;
}
