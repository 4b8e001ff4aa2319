use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use super::endpoints::EndpointRing;
use super::DnsError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on live connections per endpoint.
const MAX_CONNS_PER_ENDPOINT: usize = 64;

/// Bounded pool of TCP connections to a set of upstream endpoints.
///
/// `get` hands out an idle connection when one exists, otherwise dials the
/// next endpoint in round-robin order. Total live connections are capped at
/// `endpoints × 64`; callers block once the cap is reached. A connection
/// returned in a usable state goes back on the idle queue, a failed one is
/// dropped and its capacity slot freed.
pub struct TcpConnPool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    ring: EndpointRing,
    idle: Mutex<VecDeque<TcpStream>>,
    slots: Arc<Semaphore>,
    max_idle: usize,
}

impl TcpConnPool {
    /// `addrs` are `host:port` dial targets, already validated.
    pub fn new(addrs: Vec<String>) -> Self {
        let endpoint_count = addrs.len();
        Self {
            inner: Arc::new(PoolShared {
                ring: EndpointRing::new(addrs),
                idle: Mutex::new(VecDeque::with_capacity(endpoint_count)),
                slots: Arc::new(Semaphore::new(endpoint_count * MAX_CONNS_PER_ENDPOINT)),
                max_idle: endpoint_count * MAX_CONNS_PER_ENDPOINT,
            }),
        }
    }

    pub async fn get(&self) -> Result<PooledConn, DnsError> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| DnsError::PoolDial(e.to_string()))?;

        if let Some(stream) = self.inner.idle.lock().expect("pool lock").pop_front() {
            return Ok(PooledConn::new(stream, permit, self.inner.clone()));
        }

        // One dial attempt per endpoint before giving up.
        let mut last_err = String::from("no endpoints");
        for _ in 0..self.inner.ring.len() {
            let addr = self.inner.ring.next().to_string();
            match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    debug!("dialed upstream {}", addr);
                    return Ok(PooledConn::new(stream, permit, self.inner.clone()));
                }
                Ok(Err(e)) => last_err = format!("{}: {}", addr, e),
                Err(_) => last_err = format!("{}: dial timed out", addr),
            }
        }
        Err(DnsError::PoolDial(last_err))
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }
}

/// A checked-out pool connection. Dropping it returns the stream to the pool
/// unless [`PooledConn::mark_unusable`] was called.
pub struct PooledConn {
    stream: Option<TcpStream>,
    reusable: bool,
    pool: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    fn new(stream: TcpStream, permit: OwnedSemaphorePermit, pool: Arc<PoolShared>) -> Self {
        Self {
            stream: Some(stream),
            reusable: true,
            pool,
            _permit: permit,
        }
    }

    /// Marks the connection broken; it will be closed instead of pooled.
    pub fn mark_unusable(&mut self) {
        self.reusable = false;
    }
}

impl Deref for PooledConn {
    type Target = TcpStream;

    fn deref(&self) -> &TcpStream {
        self.stream.as_ref().expect("live pooled connection")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("live pooled connection")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if !self.reusable {
            return;
        }
        if let Some(stream) = self.stream.take() {
            let mut idle = self.pool.idle.lock().expect("pool lock");
            if idle.len() < self.pool.max_idle {
                idle.push_back(stream);
            }
        }
    }
}
