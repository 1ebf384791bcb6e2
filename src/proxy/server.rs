//! ProxyServer: hyper HTTP server exposing [`VolumeProxyFs`] over WebDAV (spec §4.7.1). Grounded
//! on `examples/original_source/pkg/webdavproxy/proxy.go`'s `Proxy`: bind an ephemeral listener,
//! serve until `Stop`, and suppress GET/HEAD content-type sniffing the same way `proxy.go`'s
//! wrapper handler does (there, by presetting an empty `Content-Type` header before calling
//! `ServeHTTP` so `http.ServeContent` skips its own sniff-by-reading-a-prefix; here, by stripping
//! whatever content-type `dav-server` infers before the response leaves the process).

use std::convert::Infallible;
use std::net::SocketAddr;

use dav_server::fakels::FakeLs;
use dav_server::DavHandler;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use log::{error, info};
use tokio::sync::oneshot;

use super::fs::VolumeProxyFs;
use crate::error::{Error, ErrorKind};

/// A running FileProxy instance. `LOCK`/`UNLOCK` are backed by `dav-server`'s in-process lock
/// table ([`FakeLs`]), matching spec §4.7.1's "in-process lock table" requirement.
pub struct ProxyServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyServer {
    /// Bind `addr` (use `127.0.0.1:0` for an ephemeral port per spec §4.6 step 6) and start
    /// serving `fs` immediately in a background task.
    pub async fn start(addr: SocketAddr, fs: VolumeProxyFs) -> Result<Self, Error> {
        let handler = DavHandler::builder()
            .filesystem(Box::new(fs))
            .locksystem(FakeLs::new())
            .build_handler();

        let make_svc = make_service_fn(move |_conn| {
            let handler = handler.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(serve(&handler, req).await) }
                }))
            }
        });

        let server = Server::bind(&addr)
            .serve(make_svc);
        let local_addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let join = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                error!("webdav proxy server exited with error: {}", err);
            }
        });

        info!("webdav proxy listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting new connections immediately; any in-flight upload is allowed to finish or
    /// fail on its own (spec §5 cancellation). Idempotent.
    pub async fn stop(mut self) -> Result<(), Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.await
                .map_err(|err| Error::with_source(ErrorKind::Fatal, "webdav proxy task panicked", err.into()))?;
        }
        Ok(())
    }
}

async fn serve(handler: &DavHandler, req: Request<Body>) -> Response<Body> {
    let suppress_content_type = matches!(req.method().as_str(), "GET" | "HEAD");
    let mut response = handler.handle(req).await;
    if suppress_content_type {
        response.headers_mut().remove(hyper::header::CONTENT_TYPE);
    }
    response
}
