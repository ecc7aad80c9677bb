use crate::{
    proxy::ProxyError,
    route::RemoteApiRoute,
    transform::{is_hop_by_hop_header, OutboundRequest},
};
use actix_web::{
    dev::Payload,
    http::StatusCode,
    web::{Bytes, BytesMut},
    HttpResponse,
};
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use reqwest::{redirect::Policy, Client};
use std::time::Duration;
use tokio::time::timeout;

/// Hands out the HTTP client used for a single proxied call. The returned
/// client is dropped when the call completes.
pub trait HttpClientFactory: Send + Sync {
    fn create_client(&self, route: &RemoteApiRoute) -> Client;
}

/// Clones of one shared client, so connections are pooled across calls.
/// Redirects are relayed to the browser rather than followed.
#[derive(Clone, Debug)]
pub struct PooledHttpClientFactory {
    client: Client,
}

impl PooledHttpClientFactory {
    pub fn new() -> Result<Self, reqwest::Error> {
        Client::builder()
            .redirect(Policy::none())
            .build()
            .map(Self::from_client)
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl HttpClientFactory for PooledHttpClientFactory {
    fn create_client(&self, _route: &RemoteApiRoute) -> Client {
        self.client.clone()
    }
}

/// Reads the inbound body, up to `limit` bytes. The timeout restarts with
/// every received chunk.
pub(crate) async fn read_body(
    mut payload: Payload,
    activity_timeout: Duration,
    limit: usize,
) -> Result<Bytes, ProxyError> {
    let mut body = BytesMut::new();
    loop {
        match timeout(activity_timeout, payload.next()).await {
            Err(_) => return Err(ProxyError::ActivityTimeout(activity_timeout)),
            Ok(None) => return Ok(body.freeze()),
            Ok(Some(chunk)) => {
                let chunk = chunk.map_err(|err| ProxyError::RequestBody(err.to_string()))?;
                if body.len() + chunk.len() > limit {
                    return Err(ProxyError::PayloadTooLarge { limit });
                }
                body.extend_from_slice(&chunk);
            }
        }
    }
}

pub(crate) async fn forward(
    client: Client,
    outbound: OutboundRequest,
    body: Bytes,
    activity_timeout: Duration,
    buffer_response: bool,
) -> Result<HttpResponse, ProxyError> {
    let request = client
        .request(outbound.method, outbound.url)
        .headers(outbound.headers)
        .body(body);

    let mut response = timeout(activity_timeout, request.send())
        .await
        .map_err(|_| ProxyError::ActivityTimeout(activity_timeout))?
        .map_err(ProxyError::Downstream)?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .map_err(|err| ProxyError::InvalidResponse(err.to_string()))?;
    let mut builder = HttpResponse::build(status);
    for (name, value) in response.headers() {
        if is_hop_by_hop_header(name.as_str()) || *name == reqwest::header::CONTENT_LENGTH {
            continue;
        }
        builder.append_header((name.as_str(), value.as_bytes()));
    }

    if buffer_response {
        let mut body = BytesMut::new();
        loop {
            match timeout(activity_timeout, response.chunk()).await {
                Err(_) => return Err(ProxyError::ActivityTimeout(activity_timeout)),
                Ok(Err(err)) => return Err(ProxyError::Downstream(err)),
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
            }
        }
        return Ok(builder.body(body.freeze()));
    }

    Ok(builder.streaming(with_idle_timeout(
        response.bytes_stream(),
        activity_timeout,
    )))
}

/// Ends the stream with [`ProxyError::ActivityTimeout`] once no chunk arrives
/// within `activity_timeout`.
pub(crate) fn with_idle_timeout<S>(
    body: S,
    activity_timeout: Duration,
) -> impl Stream<Item = Result<Bytes, ProxyError>>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + 'static,
{
    stream::unfold(Some(Box::pin(body)), move |state| async move {
        let mut body = state?;
        match timeout(activity_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(body))),
            Ok(Some(Err(err))) => {
                log::warn!("Downstream response body failed: {}.", err);
                Some((Err(ProxyError::Downstream(err)), None))
            }
            Ok(None) => None,
            Err(_) => {
                log::warn!("Downstream response idle for {:?}.", activity_timeout);
                Some((Err(ProxyError::ActivityTimeout(activity_timeout)), None))
            }
        }
    })
}
