use std::io;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::{Endpoint, Session, RECORD_CAPACITY};
use crate::errors::EndpointResult;

/// Pause after a failed accept so persistent errors (EMFILE) do not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves the endpoint on an already bound node socket.
///
/// Every connection is one session: the server opens it, reads until EOF
/// on a blocking worker, writes what it got back and closes. A rejected or
/// failed session is closed without any bytes.
pub fn spawn_node_server(
    listener: StdUnixListener,
    endpoint: Arc<Endpoint>,
    runtime: &Handle,
) -> io::Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    let _guard = runtime.enter();
    let listener = UnixListener::from_std(listener)?;
    Ok(runtime.spawn(accept_loop(listener, endpoint)))
}

async fn accept_loop(listener: UnixListener, endpoint: Arc<Endpoint>) {
    info!("[node] accepting sessions");
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_session(stream, endpoint.clone()));
            }
            Err(e) => accept_failed(e).await,
        }
    }
}

async fn accept_failed(e: io::Error) {
    warn!("[node] accept failed: {}", e);
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

async fn serve_session(mut stream: UnixStream, endpoint: Arc<Endpoint>) {
    let session = match endpoint.open() {
        Ok(session) => session,
        Err(e) => {
            warn!("[node] open failed ({}): {}", e.errno(), e);
            let _ = stream.shutdown().await;
            return;
        }
    };

    // Measurements sleep for the conversion time; keep them off the reactor.
    match tokio::task::spawn_blocking(move || drain(session)).await {
        Ok(Ok(bytes)) => {
            if let Err(e) = stream.write_all(&bytes).await {
                warn!("[node] failed to deliver {} byte(s): {}", bytes.len(), e);
            }
            debug!("[node] delivered {} byte(s)", bytes.len());
        }
        Ok(Err(e)) => {
            error!("[node] read failed ({}): {}", e.errno(), e);
        }
        Err(e) => {
            error!("[node] session worker failed: {}", e);
        }
    }
    let _ = stream.shutdown().await;
}

/// Reads a session until end-of-stream, the way `cat` would.
fn drain(mut session: Session) -> EndpointResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; RECORD_CAPACITY];
    loop {
        let n = session.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    session.release();
    Ok(out)
}
