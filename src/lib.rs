//! A fake HTTP server for unit tests of HTTP client code.
//!
//! The server answers every request with a canned body and status, and records
//! the URL of the last request so the test can assert on what the client sent.
//!
//! ```no_run
//! use fakehttpserver::{FakeHttpServer, FakeResponder};
//! use hyper::Client;
//!
//! # async fn run() -> Result<(), fakehttpserver::Error> {
//! let server = FakeHttpServer::start(FakeResponder::new(r#"{"ok":true}"#))?;
//!
//! let resp = Client::new().get(server.uri("/foo?x=1")?).await?;
//!
//! assert_eq!(200, resp.status());
//! assert_eq!("/foo?x=1", server.last_url_received().unwrap().to_string());
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```
pub mod responder;

use std::collections::BinaryHeap;
use std::env;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use futures::future;
use hyper::client::connect::dns::GaiResolver;
use hyper::client::HttpConnector;
use hyper::http::uri::InvalidUri;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Server, Uri};
use lazy_static::lazy_static;
use test_context::AsyncTestContext;
use tokio::sync::oneshot::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use hyper::StatusCode;
pub use crate::responder::{FakeResponder, Response, INJECTED_ERROR_BODY};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fixed port to bind instead of taking one from the pool.
pub const PORT_ENV_VAR: &str = "FAKEHTTPSERVER_PORT";

lazy_static! {
    static ref PORTS: Mutex<BinaryHeap<u16>> = Mutex::new(BinaryHeap::from((12300u16..12400u16).collect::<Vec<u16>>()));
}

enum Port {
    Pooled(u16),
    Fixed(u16),
}

impl Port {
    fn number(&self) -> u16 {
        match self {
            Port::Pooled(port) | Port::Fixed(port) => *port,
        }
    }
}

fn take_port() -> Result<Port, Error> {
    if let Some(port) = env::var(PORT_ENV_VAR).ok().and_then(|value| value.parse::<u16>().ok()) {
        return Ok(Port::Fixed(port));
    }
    let mut ports = PORTS.lock().map_err(|_| "port pool lock poisoned")?;
    ports.pop().map(Port::Pooled).ok_or_else(|| "no free port left in the pool".into())
}

fn release_port(port: Port) {
    if let Port::Pooled(port) = port {
        if let Ok(mut ports) = PORTS.lock() {
            ports.push(port)
        }
    }
}

fn dispatch(responder: &Mutex<FakeResponder>, req: Request<Body>) -> Result<Response, Error> {
    debug!(method = %req.method(), uri = %req.uri(), "fake responder received request");
    let mut responder = responder.lock().map_err(|_| "fake responder lock poisoned")?;
    responder.handle(&req).map_err(|err| {
        warn!(error = %err, "fake responder could not build response");
        err.into()
    })
}

/// Binds `addr` and serves every request with `responder` until `rx` fires.
pub fn run_service(addr: SocketAddr, rx: Receiver<()>,
    responder: Arc<Mutex<FakeResponder>>) -> Result<impl Future<Output = Result<(), hyper::Error>>, hyper::Error> {

    let new_service = make_service_fn(move |_| {
        let responder = responder.clone();
        async move {
            Ok::<_, Error>(service_fn(move |req| {
                future::ready(dispatch(&responder, req))
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(new_service);

    Ok(server.with_graceful_shutdown(async { rx.await.ok(); }))
}

/// A running fake server bound to a loopback port.
pub struct FakeHttpServer {
    server_handler: JoinHandle<Result<(), hyper::Error>>,
    sender: Sender<()>,
    port: Port,
    responder: Arc<Mutex<FakeResponder>>,
}

impl FakeHttpServer {
    /// Must be called from within a tokio runtime.
    ///
    /// A pooled port that cannot be bound is dropped from the pool and the next
    /// one is tried. A port fixed through [`PORT_ENV_VAR`] is not retried.
    pub fn start(responder: FakeResponder) -> Result<FakeHttpServer, Error> {
        let responder = Arc::new(Mutex::new(responder));
        loop {
            let port = take_port()?;
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port.number()));
            let (sender, receiver) = tokio::sync::oneshot::channel::<()>();
            let service = match (run_service(addr, receiver, responder.clone()), &port) {
                (Ok(service), _) => service,
                (Err(err), Port::Pooled(_)) => {
                    warn!(%addr, error = %err, "dropping unusable port from the pool");
                    continue;
                }
                (Err(err), Port::Fixed(_)) => return Err(err.into()),
            };
            let server_handler = tokio::spawn(service);
            debug!(%addr, "fake http server started");
            return Ok(FakeHttpServer {
                server_handler,
                sender,
                port,
                responder,
            });
        }
    }

    pub fn port(&self) -> u16 {
        self.port.number()
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port()))
    }

    /// Absolute URL for `path_and_query`; a missing leading `/` is added.
    pub fn uri(&self, path_and_query: &str) -> Result<Uri, InvalidUri> {
        let slash = if path_and_query.starts_with('/') { "" } else { "/" };
        format!("http://{}:{}{}{}", "localhost", self.port(), slash, path_and_query).parse::<Uri>()
    }

    /// Locks the responder, to reconfigure it or inspect it.
    ///
    /// Don't hold the guard while a request is in flight: the server needs the
    /// same lock to answer it.
    pub fn responder(&self) -> MutexGuard<'_, FakeResponder> {
        match self.responder.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn configure(&self, response_json: impl Into<String>, status: Option<u16>) {
        self.responder().configure(response_json, status)
    }

    pub fn last_url_received(&self) -> Option<Uri> {
        self.responder().last_url_received().cloned()
    }

    pub async fn shutdown(self) {
        let _ = self.sender.send(());
        match self.server_handler.await {
            Ok(Err(err)) => warn!(error = %err, "fake http server stopped with an error"),
            Err(err) => warn!(error = %err, "fake http server task failed"),
            Ok(Ok(())) => debug!(port = self.port.number(), "fake http server stopped"),
        }
        release_port(self.port)
    }
}

/// Test context running a [`FakeHttpServer`] with an empty 200 response.
pub struct HttpTestContext {
    pub client: Client<HttpConnector<GaiResolver>, Body>,
    pub port: u16,
    pub server: FakeHttpServer,
}

impl HttpTestContext {
    pub fn uri(&self, path_and_query: &str) -> Result<Uri, InvalidUri> {
        self.server.uri(path_and_query)
    }

    pub fn configure(&self, response_json: impl Into<String>, status: Option<u16>) {
        self.server.configure(response_json, status)
    }

    pub fn last_url_received(&self) -> Option<Uri> {
        self.server.last_url_received()
    }
}

#[async_trait::async_trait]
impl AsyncTestContext for HttpTestContext {
    async fn setup() -> HttpTestContext {
        let server = FakeHttpServer::start(FakeResponder::default()).expect("fake http server");
        HttpTestContext {
            client: Client::new(),
            port: server.port(),
            server,
        }
    }

    async fn teardown(self) {
        self.server.shutdown().await
    }
}

#[cfg(test)]
mod test {
    use hyper::{Body, Method, Request, StatusCode};
    use test_context::test_context;
    use crate::{HttpTestContext, INJECTED_ERROR_BODY};

    async fn body_string(resp: hyper::Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test_context(HttpTestContext)]
    #[tokio::test]
    async fn test_get_without_configuration_sends_empty_200(ctx: &mut HttpTestContext) {
        let resp = ctx.client.get(ctx.uri("/").unwrap()).await.unwrap();

        assert_eq!(200, resp.status());
        assert_eq!("", body_string(resp).await);
        assert_eq!("/", ctx.last_url_received().unwrap().to_string());
    }

    #[test_context(HttpTestContext)]
    #[tokio::test]
    async fn test_get_respond_injected_404(ctx: &mut HttpTestContext) {
        ctx.configure("{}", Some(StatusCode::NOT_FOUND.as_u16()));

        let resp = ctx.client.get(ctx.uri("/unknown").unwrap()).await.unwrap();

        assert_eq!(404, resp.status());
        assert_eq!(INJECTED_ERROR_BODY, body_string(resp).await);
    }

    #[test_context(HttpTestContext)]
    #[tokio::test]
    async fn test_post_body_is_ignored(ctx: &mut HttpTestContext) {
        ctx.configure("ok", Some(200));
        let req = Request::builder()
            .method(Method::POST)
            .uri(ctx.uri("/baz").unwrap())
            .body(Body::from("foo=bar"))
            .expect("request builder");

        let resp = ctx.client.request(req).await.unwrap();

        assert_eq!(200, resp.status());
        assert_eq!("ok", body_string(resp).await);
        assert_eq!("/baz", ctx.last_url_received().unwrap().to_string());
    }

    #[test_context(HttpTestContext)]
    #[tokio::test]
    async fn test_invalid_status_drops_connection(ctx: &mut HttpTestContext) {
        ctx.configure("{}", Some(1000));

        assert!(ctx.client.get(ctx.uri("/broken").unwrap()).await.is_err());
        assert_eq!("/broken", ctx.last_url_received().unwrap().to_string());
    }

    #[test_context(HttpTestContext)]
    #[tokio::test]
    async fn test_uri_adds_missing_leading_slash(ctx: &mut HttpTestContext) {
        let uri = ctx.uri("foo?x=1").unwrap();

        assert_eq!(format!("http://localhost:{}/foo?x=1", ctx.port), uri.to_string());
        assert_eq!(ctx.uri("/foo?x=1").unwrap(), uri);
    }

    #[test_context(HttpTestContext)]
    #[tokio::test]
    async fn test_uri_rejects_invalid_path(ctx: &mut HttpTestContext) {
        assert!(ctx.uri("/with space").is_err());
    }
}
