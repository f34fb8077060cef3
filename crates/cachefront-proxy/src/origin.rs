use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Uri};
use bytes::Bytes;
use cachefront::headers::X_FORWARDED_PROTO;
use cachefront::{Origin, OriginError, OriginEvent, OriginStream, RequestHeaders, ResponseHeaders};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper::body::{Body as _, Incoming};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;

pub type HttpClient = Client<HttpConnector, Body>;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Fetches cache misses and validations from the configured upstream.
pub struct HyperOrigin {
    client: HttpClient,
    upstream_url: String,
}

impl HyperOrigin {
    pub fn new(client: HttpClient, upstream_url: String) -> Self {
        Self {
            client,
            upstream_url,
        }
    }
}

/// `uri`'s path and query on the upstream base URL.
pub fn upstream_uri(base: &str, uri: &Uri) -> Result<Uri, OriginError> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base.trim_end_matches('/'), path)
        .parse()
        .map_err(|_| OriginError::NoRoute)
}

#[async_trait]
impl Origin for HyperOrigin {
    async fn send(&self, request: RequestHeaders) -> Result<OriginStream, OriginError> {
        let upstream_uri = upstream_uri(&self.upstream_url, &request.uri)?;
        let scheme = request.scheme().unwrap_or("http").to_owned();

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        if let Ok(v) = HeaderValue::from_str(&scheme) {
            headers.insert(X_FORWARDED_PROTO, v);
        }

        let mut upstream_req = Request::builder()
            .method(request.method)
            .uri(&upstream_uri)
            .body(Body::empty())
            .map_err(|_| OriginError::NoRoute)?;
        *upstream_req.headers_mut() = headers;

        let response = self.client.request(upstream_req).await.map_err(|e| {
            tracing::warn!(error = %e, upstream = %upstream_uri, "upstream request failed");
            if e.is_connect() {
                OriginError::Connect(e.to_string())
            } else {
                OriginError::Reset(e.to_string())
            }
        })?;

        let (parts, body) = response.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        let end_stream = body.is_end_stream();
        let head = OriginEvent::Headers {
            headers: ResponseHeaders {
                status: parts.status,
                headers,
            },
            end_stream,
        };

        let rest = if end_stream {
            futures_util::stream::empty().boxed()
        } else {
            body_events(body).boxed()
        };
        Ok(futures_util::stream::once(async move { Ok(head) })
            .chain(rest)
            .boxed())
    }
}

/// Body frames as origin events. A body that ends without flagging its last
/// frame gets an empty terminating data event.
fn body_events(body: Incoming) -> impl futures_util::Stream<Item = Result<OriginEvent, OriginError>> {
    futures_util::stream::unfold(Some(body), |body| async move {
        let mut body = body?;
        loop {
            let frame = match body.frame().await {
                None => {
                    let done = OriginEvent::Data {
                        data: Bytes::new(),
                        end_stream: true,
                    };
                    return Some((Ok(done), None));
                }
                Some(Err(e)) => return Some((Err(OriginError::Reset(e.to_string())), None)),
                Some(Ok(frame)) => frame,
            };
            let end_stream = body.is_end_stream();
            match frame.into_data() {
                Ok(data) => {
                    let next = if end_stream { None } else { Some(body) };
                    return Some((Ok(OriginEvent::Data { data, end_stream }), next));
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        return Some((Ok(OriginEvent::Trailers(trailers)), None));
                    }
                }
            }
        }
    })
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper_util::rt::TokioExecutor;

    fn origin(url: &str) -> HyperOrigin {
        HyperOrigin::new(Client::builder(TokioExecutor::new()).build_http(), url.to_string())
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let uri: Uri = "/a/b?c=1".parse().unwrap();
        assert_eq!(
            upstream_uri("http://origin.internal:3000/", &uri).unwrap(),
            "http://origin.internal:3000/a/b?c=1"
        );
    }

    #[test]
    fn bad_upstream_url_has_no_route() {
        let uri: Uri = "/a".parse().unwrap();
        assert_eq!(upstream_uri("not a url", &uri), Err(OriginError::NoRoute));
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("etag", HeaderValue::from_static("\"v1\""));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("etag"));
    }

    #[tokio::test]
    async fn unreachable_origin_is_a_connect_error() {
        let o = origin("http://127.0.0.1:1");
        let req = RequestHeaders::new(axum::http::Method::GET, "/".parse().unwrap());
        match o.send(req).await {
            Err(OriginError::Connect(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected connect failure"),
        }
    }
}
