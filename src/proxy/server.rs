//! Proxy server implementation
//!
//! Makes the host runtime addressable: accepts HTTP/1.1 proxy requests,
//! maps each one to a client context and routes it through
//! [`HostRuntime::fetch`].

use crate::host::{FetchError, HostRuntime};
use crate::models::{
    header_value_bytes, header_value_to_string, ClientId, HttpMethod, InterceptedRequest,
    InterceptedResponse, ResponseSource,
};
use bytes::Bytes;
use dashmap::DashSet;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Header carrying the client context id. Requests without it belong to a
/// client context scoped to their connection.
pub const CLIENT_HEADER: &str = "x-interceptor-client";
/// Response header naming where the response came from
pub const SOURCE_HEADER: &str = "x-interceptor-source";

const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

const SKIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Bind `addr` and serve until `shutdown` fires.
pub async fn run_server(
    addr: &str,
    host: Arc<HostRuntime>,
    shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, host, shutdown).await
}

/// Accept loop over an already bound listener
pub async fn serve(
    listener: TcpListener,
    host: Arc<HostRuntime>,
    mut shutdown: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    tracing::info!("Proxy server listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    let host = host.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, peer_addr, host).await {
                            let err_str = e.to_string().to_lowercase();
                            if err_str.contains("connection reset")
                                || err_str.contains("broken pipe")
                                || err_str.contains("connection closed")
                            {
                                tracing::debug!("Connection closed by client: {}", e);
                            } else {
                                tracing::error!("Error handling connection: {}", e);
                            }
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }
    }

    tracing::info!("Proxy server stopped");
    Ok(())
}

/// Serve one client connection. Every client context first opened by this
/// connection (its own default one, or ids named by [`CLIENT_HEADER`]) is
/// closed when the connection ends.
async fn handle_connection<I>(
    io: I,
    peer_addr: SocketAddr,
    host: Arc<HostRuntime>,
) -> anyhow::Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_client = ClientId::new();
    let opened: Arc<DashSet<ClientId>> = Arc::new(DashSet::new());
    let io = TokioIo::new(io);

    let service_host = host.clone();
    let service_opened = opened.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let host = service_host.clone();
        let opened = service_opened.clone();
        let connection_client = connection_client.clone();
        async move {
            Ok::<_, Infallible>(handle_request(req, &host, &connection_client, &opened).await)
        }
    });

    let result = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await;

    let opened: Vec<ClientId> = opened.iter().map(|client| client.key().clone()).collect();
    for client in &opened {
        host.close_client(client).await;
    }
    tracing::debug!(
        "Connection from {} ended; closed {} client(s)",
        peer_addr,
        opened.len()
    );
    result.map_err(anyhow::Error::from)
}

async fn handle_request<B>(
    req: Request<B>,
    host: &HostRuntime,
    connection_client: &ClientId,
    opened: &DashSet<ClientId>,
) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    if req.method() == hyper::Method::CONNECT {
        return respond_with_status(
            StatusCode::NOT_IMPLEMENTED,
            "CONNECT tunnelling is not supported",
        );
    }

    let client = req
        .headers()
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(ClientId::from)
        .unwrap_or_else(|| connection_client.clone());
    if host.attach_client(client.clone()) {
        opened.insert(client.clone());
    }

    let request = match read_request(req).await {
        Ok(request) => request,
        Err(rejection) => return rejection,
    };

    tracing::debug!(
        "{} {} from client {}",
        request.method(),
        request.url(),
        client
    );

    match host.fetch(&client, request).await {
        Ok(response) => into_hyper_response(response),
        Err(err) => {
            tracing::warn!("Fetch failed: {}", err);
            let message = match &err {
                FetchError::Network(_) => "Unable to reach upstream server",
                FetchError::Dispatch(_) => "Interceptor failed to produce a response",
            };
            respond_with_status(StatusCode::BAD_GATEWAY, message)
        }
    }
}

/// Convert an inbound proxy request into an intercepted request descriptor.
/// Method, repeated headers and header bytes are carried over unchanged;
/// only [`CLIENT_HEADER`] is consumed here.
async fn read_request<B>(req: Request<B>) -> Result<InterceptedRequest, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let url = match target_url(&req) {
        Some(url) => url,
        None => {
            return Err(respond_with_status(
                StatusCode::BAD_REQUEST,
                "Unable to determine request target",
            ))
        }
    };
    let method = HttpMethod::from(req.method());

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| !name.as_str().eq_ignore_ascii_case(CLIENT_HEADER))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                header_value_to_string(value.as_bytes()),
            )
        })
        .collect();

    let body = match Limited::new(req.into_body(), MAX_REQUEST_BODY_BYTES)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::warn!("Failed to read request body: {}", err);
            let rejection = if err.downcast_ref::<LengthLimitError>().is_some() {
                respond_with_status(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body exceeds allowed size",
                )
            } else {
                respond_with_status(StatusCode::BAD_REQUEST, "Failed to read request body")
            };
            return Err(rejection);
        }
    };

    let mut request = InterceptedRequest::new(method, url).with_headers(headers);
    if !body.is_empty() {
        request = request.with_body(body.to_vec());
    }
    Ok(request)
}

/// Absolute-form URIs are used as-is; origin-form ones are resolved against
/// the Host header.
fn target_url<B>(req: &Request<B>) -> Option<String> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.to_string());
    }
    let host = req.headers().get(hyper::header::HOST)?.to_str().ok()?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Some(format!("http://{}{}", host, path))
}

fn into_hyper_response(response: InterceptedResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        builder = builder.header(name.as_str(), header_value_bytes(value));
    }
    builder = builder.header(SOURCE_HEADER, source_label(response.source));
    match builder.body(Full::new(Bytes::from(response.body))) {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!("Invalid response from interceptor: {}", err);
            respond_with_status(StatusCode::BAD_GATEWAY, "Invalid response")
        }
    }
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Network => "network",
        ResponseSource::Store => "store",
        ResponseSource::Synthesized => "synthesized",
    }
}

fn respond_with_status(code: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = code;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain"),
    );
    response
}
