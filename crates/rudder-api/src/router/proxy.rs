use std::convert::Infallible;
use std::future::poll_fn;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use http_body::combinators::UnsyncBoxBody;
use hyper::body::HttpBody;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Client, Method, Request, Response, StatusCode, Uri};
use prost::Message;
use rudder_proto::resource::ResponseMetadata;
use rudder_state::constants;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backend::{RemoteConnector, UdsConnector};
use super::detector::StreamingDetector;

/// Request header carrying the endpoint selector: a comma-separated list of
/// nodes to forward the call to. An empty value selects the configured
/// control plane endpoints; no header means the local backend.
pub const NODES_HEADER: &str = "nodes";

/// Response body of the proxy: an upstream body passed through untouched,
/// or the merged frames of an aggregated call.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Routes each incoming call to its backends and moves opaque frames
/// between the connections.
///
/// Single-backend calls are fully transparent. Aggregated calls (streamed
/// methods addressed to one or more remote nodes) fan out to every node and
/// merge the response streams; each relayed message gets the node's
/// hostname appended as its metadata envelope, and a failing node
/// contributes one metadata-only message carrying the error instead of
/// aborting the merged stream.
pub struct Router {
    detector: StreamingDetector,
    local: Client<UdsConnector, Body>,
    remote: Client<RemoteConnector, Body>,
    remote_scheme: &'static str,
    endpoints: Vec<String>,
}

impl Router {
    /// Builds a router forwarding to the given local socket. Remote nodes
    /// are dialed with the client TLS configuration when one is given and
    /// over plain TCP otherwise; `endpoints` is the control plane node set
    /// used when a request asks for aggregation without naming nodes.
    pub fn new(
        local_socket: impl Into<PathBuf>,
        client_config: Option<Arc<ClientConfig>>,
        endpoints: Vec<String>,
    ) -> Self {
        let local = Client::builder()
            .http2_only(true)
            .build(UdsConnector::new(local_socket));

        let remote_scheme = if client_config.is_some() { "https" } else { "http" };
        let remote = Client::builder()
            .http2_only(true)
            .build(RemoteConnector::new(client_config));

        Router {
            detector: StreamingDetector::with_defaults(),
            local,
            remote,
            remote_scheme,
            endpoints,
        }
    }

    /// Handles one call. Backend failures are reported to the client as a
    /// gRPC status rather than a broken transport.
    pub async fn route(&self, request: Request<Body>) -> Result<Response<ProxyBody>, Infallible> {
        match self.forward(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(error = %err, "error forwarding call");

                Ok(grpc_error(tonic::Code::Unavailable, &err.to_string()))
            }
        }
    }

    async fn forward(&self, request: Request<Body>) -> anyhow::Result<Response<ProxyBody>> {
        let method = request.uri().path().to_string();
        let streamed = self.detector.is_streamed(&method);
        let nodes = self.targets(request.headers());

        let (parts, body) = request.into_parts();

        if nodes.is_empty() {
            // Streamed methods get raw bidirectional passthrough; unary
            // request bodies are aggregated before dialing so the backend
            // sees a single message even if the client trickles frames.
            let body = if streamed {
                body
            } else {
                Body::from(hyper::body::to_bytes(body).await?)
            };

            debug!(method = %method, streamed = streamed, "forwarding local call");

            let uri: Uri = format!("http://rudderd{}", method).parse()?;
            let outgoing = build_request(parts.method, uri, &parts.headers, body)?;
            let response = self.local.request(outgoing).await?;

            return Ok(response.map(|body| body.boxed_unsync()));
        }

        // Remote calls buffer the request so it can be replayed per node.
        let request_body = hyper::body::to_bytes(body).await?;

        if streamed {
            debug!(method = %method, nodes = nodes.len(), "aggregating streamed call");

            return Ok(self.aggregate(&method, &parts.headers, request_body, nodes));
        }

        // Unary calls go to a single node, payload untouched.
        let node = &nodes[0];

        debug!(method = %method, node = %node, "forwarding remote call");

        let uri: Uri =
            format!("{}://{}{}", self.remote_scheme, remote_authority(node), method).parse()?;
        let outgoing = build_request(parts.method, uri, &parts.headers, Body::from(request_body))?;
        let response = self.remote.request(outgoing).await?;

        Ok(response.map(|body| body.boxed_unsync()))
    }

    /// Resolves the remote target set from the `nodes` header. An empty
    /// header value falls back to the configured endpoints.
    fn targets(&self, headers: &HeaderMap) -> Vec<String> {
        let value = match headers.get(NODES_HEADER) {
            Some(value) => value.to_str().unwrap_or(""),
            None => return Vec::new(),
        };

        let nodes: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .map(str::to_string)
            .collect();

        if nodes.is_empty() {
            self.endpoints.clone()
        } else {
            nodes
        }
    }

    /// Fans a server-streaming call out to every node and merges the
    /// response streams. The merged stream always terminates with an OK
    /// status; per-node failures travel inside it as metadata-only frames.
    fn aggregate(
        &self,
        method: &str,
        headers: &HeaderMap,
        request_body: Bytes,
        nodes: Vec<String>,
    ) -> Response<ProxyBody> {
        let (frames_tx, frames_rx) = mpsc::channel(16);

        for node in nodes {
            let client = self.remote.clone();
            let scheme = self.remote_scheme;
            let method = method.to_string();
            let headers = headers.clone();
            let request_body = request_body.clone();
            let frames = frames_tx.clone();

            tokio::spawn(async move {
                if let Err(error) =
                    relay(&client, scheme, &method, &headers, request_body, &node, &frames).await
                {
                    debug!(node = %node, error = %error, "node failed during aggregation");

                    let _ = frames.send(error_frame(&node, &error)).await;
                }
            });
        }

        // Once every relay has dropped its sender the merged body ends.
        drop(frames_tx);

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/grpc")
            .body(AggregateBody { frames: frames_rx }.boxed_unsync())
            .expect("static response parts")
    }
}

/// Body of an aggregated response, fed by the per-node relay tasks.
struct AggregateBody {
    frames: mpsc::Receiver<Bytes>,
}

impl HttpBody for AggregateBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, hyper::Error>>> {
        self.get_mut().frames.poll_recv(cx).map(|frame| frame.map(Ok))
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, hyper::Error>> {
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));

        Poll::Ready(Ok(Some(trailers)))
    }
}

/// Relays one node's response stream into the merged channel, tagging every
/// message with the node's hostname. Returns the user-visible error text
/// when the node's call fails at any point.
async fn relay(
    client: &Client<RemoteConnector, Body>,
    scheme: &'static str,
    method: &str,
    headers: &HeaderMap,
    request_body: Bytes,
    node: &str,
    frames: &mpsc::Sender<Bytes>,
) -> Result<(), String> {
    let uri: Uri = format!("{}://{}{}", scheme, remote_authority(node), method)
        .parse()
        .map_err(|err: hyper::http::uri::InvalidUri| err.to_string())?;

    let outgoing = build_request(Method::POST, uri, headers, Body::from(request_body))
        .map_err(|err| err.to_string())?;

    let response = client.request(outgoing).await.map_err(|err| err.to_string())?;

    if let Some(failure) = grpc_failure(response.headers()) {
        return Err(failure);
    }

    let mut body = response.into_body();
    let mut decoder = FrameDecoder::default();

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        decoder.push(&chunk);

        while let Some(frame) = decoder.next_frame() {
            if frames.send(tag_frame(frame, node)).await.is_err() {
                // Client went away, stop relaying.
                return Ok(());
            }
        }
    }

    let trailers = poll_fn(|cx| Pin::new(&mut body).poll_trailers(cx))
        .await
        .map_err(|err| err.to_string())?;

    if let Some(trailers) = trailers {
        if let Some(failure) = grpc_failure(&trailers) {
            return Err(failure);
        }
    }

    Ok(())
}

/// `host` or `host:port`; a bare host gets the default port.
fn remote_authority(node: &str) -> String {
    if node.contains(':') {
        node.to_string()
    } else {
        format!("{}:{}", node, constants::APID_PORT)
    }
}

fn build_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    body: Body,
) -> Result<Request<Body>, hyper::http::Error> {
    let mut request = Request::builder().method(method).uri(uri).body(body)?;

    for (name, value) in headers {
        // The nodes header is the selector for this hop, not for the
        // backend: forwarding it would make a remote router fan out again.
        if name == &HOST || name.as_str() == NODES_HEADER {
            continue;
        }

        request.headers_mut().insert(name, value.clone());
    }

    Ok(request)
}

/// Extracts the failure from a headers or trailers block, if any.
fn grpc_failure(headers: &HeaderMap) -> Option<String> {
    let status = headers.get("grpc-status")?.to_str().ok()?;

    if status == "0" {
        return None;
    }

    let message = headers
        .get("grpc-message")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if message.is_empty() {
        Some(code_name(status))
    } else {
        Some(message.to_string())
    }
}

fn code_name(status: &str) -> String {
    match status.parse::<i32>() {
        Ok(code) => format!("{:?}", tonic::Code::from(code)).to_lowercase(),
        Err(_) => format!("status {}", status),
    }
}

/// Splits a gRPC byte stream into length-prefixed messages.
#[derive(Default)]
struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < 5 {
            return None;
        }

        let header: [u8; 4] = self.buffer[1..5].try_into().expect("sliced four bytes");
        let len = u32::from_be_bytes(header) as usize;

        if self.buffer.len() < 5 + len {
            return None;
        }

        Some(Frame(self.buffer.split_to(5 + len).freeze()))
    }
}

/// One length-prefixed gRPC message: compression flag, length, payload.
struct Frame(Bytes);

impl Frame {
    fn flags(&self) -> u8 {
        self.0[0]
    }

    fn payload(&self) -> &[u8] {
        &self.0[5..]
    }

    fn into_bytes(self) -> Bytes {
        self.0
    }
}

/// Appends the node's metadata envelope to a relayed message.
///
/// Every streamed API message reserves field 1 for `ResponseMetadata` and
/// the backend leaves it unset, so appending the encoded field to the
/// payload sets it without decoding the message (concatenation of encoded
/// protobufs merges their fields). Compressed messages can't be extended
/// this way and pass through untouched.
fn tag_frame(frame: Frame, node: &str) -> Bytes {
    if frame.flags() != 0 {
        return frame.into_bytes();
    }

    encode_frame(frame.payload(), &metadata_field(node, ""))
}

/// A message carrying only the metadata envelope: how a failed node shows
/// up inside an otherwise healthy aggregated stream.
fn error_frame(node: &str, error: &str) -> Bytes {
    encode_frame(&[], &metadata_field(node, error))
}

fn encode_frame(payload: &[u8], suffix: &[u8]) -> Bytes {
    let len = payload.len() + suffix.len();

    let mut framed = BytesMut::with_capacity(5 + len);
    framed.put_u8(0);
    framed.put_u32(len as u32);
    framed.put_slice(payload);
    framed.put_slice(suffix);

    framed.freeze()
}

/// Wire encoding of a `metadata` field (tag 1) holding the envelope.
fn metadata_field(hostname: &str, error: &str) -> Vec<u8> {
    let metadata = ResponseMetadata {
        hostname: hostname.to_string(),
        error: error.to_string(),
    };
    let encoded = metadata.encode_to_vec();

    let mut field = Vec::with_capacity(encoded.len() + 3);
    field.put_u8(0x0a);
    prost::encoding::encode_varint(encoded.len() as u64, &mut field);
    field.extend_from_slice(&encoded);

    field
}

/// Builds a trailers-only gRPC failure response.
fn grpc_error(code: tonic::Code, message: &str) -> Response<ProxyBody> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/grpc")
        .header("grpc-status", (code as i32).to_string())
        .body(Body::empty().boxed_unsync())
        .expect("static response parts");

    if let Ok(value) = HeaderValue::from_str(message) {
        response.headers_mut().insert("grpc-message", value);
    }

    response
}

/// Serves the proxy on the local UNIX socket (no TLS).
pub async fn serve_unix(
    router: Arc<Router>,
    listener: UnixListener,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    warn!(error = %err, "error accepting connection");
                    continue;
                }
            },
        };

        serve_connection(router.clone(), stream, shutdown.clone());
    }
}

/// Serves the proxy on TCP with mutually-authenticated TLS.
pub async fn serve_tls(
    router: Arc<Router>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let tcp = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((tcp, _addr)) => tcp,
                Err(err) => {
                    warn!(error = %err, "error accepting connection");
                    continue;
                }
            },
        };

        let router = router.clone();
        let acceptor = acceptor.clone();
        let shutdown = shutdown.clone();

        // Handshakes happen off the accept loop so a slow peer can't stall
        // other clients.
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(stream) => serve_connection(router, stream, shutdown),
                Err(err) => debug!(error = %err, "TLS handshake failed"),
            }
        });
    }
}

fn serve_connection<S>(router: Arc<Router>, stream: S, shutdown: CancellationToken)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let service = service_fn(move |request| {
            let router = router.clone();

            async move { router.route(request).await }
        });

        let connection = Http::new().http2_only(true).serve_connection(stream, service);

        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = connection => {
                if let Err(err) = result {
                    debug!(error = %err, "connection closed");
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_decoder_reassembles_split_frames() {
        let mut decoder = FrameDecoder::default();

        let frame = encode_frame(b"hello", b"");
        decoder.push(&frame[..3]);
        assert!(decoder.next_frame().is_none());

        decoder.push(&frame[3..]);
        let decoded = decoder.next_frame().unwrap();
        assert_eq!(decoded.flags(), 0);
        assert_eq!(decoded.payload(), b"hello");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn tagged_frames_decode_with_the_node_hostname() {
        use rudder_proto::resource::ListResponse;

        let response = ListResponse::default();
        let frame = encode_frame(&response.encode_to_vec(), b"");

        let mut decoder = FrameDecoder::default();
        decoder.push(&tag_frame(Frame(frame), "10.0.0.5"));

        let tagged = decoder.next_frame().unwrap();
        let decoded = ListResponse::decode(tagged.payload()).unwrap();
        let metadata = decoded.metadata.unwrap();
        assert_eq!(metadata.hostname, "10.0.0.5");
        assert!(metadata.error.is_empty());
    }

    #[test]
    fn error_frames_carry_only_the_envelope() {
        use rudder_proto::resource::ListResponse;

        let mut decoder = FrameDecoder::default();
        decoder.push(&error_frame("10.0.0.6", "unavailable"));

        let frame = decoder.next_frame().unwrap();
        let decoded = ListResponse::decode(frame.payload()).unwrap();
        assert!(decoded.definition.is_none());
        assert!(decoded.resource.is_none());

        let metadata = decoded.metadata.unwrap();
        assert_eq!(metadata.hostname, "10.0.0.6");
        assert_eq!(metadata.error, "unavailable");
    }

    #[test]
    fn grpc_failure_reads_status_and_message() {
        let mut headers = HeaderMap::new();
        assert_eq!(grpc_failure(&headers), None);

        headers.insert("grpc-status", HeaderValue::from_static("0"));
        assert_eq!(grpc_failure(&headers), None);

        headers.insert("grpc-status", HeaderValue::from_static("14"));
        assert_eq!(grpc_failure(&headers), Some("unavailable".to_string()));

        headers.insert("grpc-message", HeaderValue::from_static("backend down"));
        assert_eq!(grpc_failure(&headers), Some("backend down".to_string()));
    }
}
