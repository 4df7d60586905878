//! Plaintext tunnel relay.
//!
//! Pumps HTTP/1.1 messages between the client side of a CONNECT tunnel and
//! the destination: one request, then its response, strictly in order.
//! Bodies are passed on as they arrive.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

use crate::error::RelayError;
use crate::http1;

/// Counters for a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Completed request/response pairs.
    pub exchanges: u64,
    /// The tunnel switched protocols and ended as a raw byte copy.
    pub upgraded: bool,
}

/// Relays messages until either side closes or a message fails to frame.
///
/// A clean close by the client between requests ends the relay with `Ok`.
/// Both ends are shut down before returning.
pub async fn relay<C, U>(client: C, upstream: U) -> Result<RelayStats, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    relay_until(client, upstream, std::future::pending()).await
}

/// Like [`relay`], but also ends when `stop` resolves while the tunnel is
/// idle between exchanges.
pub async fn relay_until<C, U, S>(client: C, upstream: U, stop: S) -> Result<RelayStats, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut client = BufStream::new(client);
    let mut upstream = BufStream::new(upstream);
    let mut stats = RelayStats::default();

    tokio::pin!(stop);
    let result = pump(&mut client, &mut upstream, &mut stats, stop).await;

    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;

    result.map(|()| stats)
}

async fn pump<C, U, S>(
    client: &mut BufStream<C>,
    upstream: &mut BufStream<U>,
    stats: &mut RelayStats,
    mut stop: Pin<&mut S>,
) -> Result<(), RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    loop {
        // Only an idle tunnel stops; a request already started is finished
        let closed = tokio::select! {
            biased;
            ready = client.fill_buf() => ready?.is_empty(),
            () = stop.as_mut() => return Ok(()),
        };
        if closed {
            return Ok(());
        }

        let Some(request) = http1::copy_request(client, upstream).await? else {
            return Ok(());
        };
        tracing::trace!("Relaying {} {}", request.method, request.target);

        loop {
            let response = http1::copy_response(upstream, client, &request.method).await?;

            if response.is_upgrade() {
                stats.upgraded = true;
                tokio::io::copy_bidirectional(client, upstream).await?;
                return Ok(());
            }
            if response.is_interim() {
                continue;
            }

            stats.exchanges += 1;
            if response.close_delimited {
                return Ok(());
            }
            break;
        }
    }
}
