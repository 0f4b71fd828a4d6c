//! Bidirectional relay between a redirected client and its upstream.
//!
//! Each direction copies until its source reaches end-of-stream, then:
//! 1. half-closes the destination (`shutdown` of the write side),
//! 2. arms a linger deadline on reads from that destination, so a peer that
//!    never finishes its own half cannot hold the connection open.
//!
//! The client→upstream direction runs on a spawned task and reports through
//! a one-shot channel; upstream→client runs inline. The relay returns only
//! after both directions are done.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Default linger deadline after a half-close.
pub const DEFAULT_LINGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Copy buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

impl RelayStats {
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Write side of a read deadline.
#[derive(Debug)]
struct DeadlineArm(watch::Sender<Option<Instant>>);

/// Read side of a read deadline.
#[derive(Debug)]
struct DeadlineWatch(watch::Receiver<Option<Instant>>);

fn read_deadline() -> (DeadlineArm, DeadlineWatch) {
    let (tx, rx) = watch::channel(None);
    (DeadlineArm(tx), DeadlineWatch(rx))
}

impl DeadlineArm {
    fn arm(&self, after: Duration) {
        // The reader may already be gone; the deadline is moot then.
        let _ = self.0.send(Some(Instant::now() + after));
    }
}

impl DeadlineWatch {
    /// Read into `buf`, failing with `TimedOut` once the deadline (if armed)
    /// passes. The deadline may be armed while the read is pending.
    async fn read<R>(&mut self, reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let armed = *self.0.borrow_and_update();
            if let Some(at) = armed {
                return match tokio::time::timeout_at(at, reader.read(buf)).await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")),
                };
            }

            tokio::select! {
                result = reader.read(buf) => return result,
                changed = self.0.changed() => {
                    if changed.is_err() && self.0.borrow().is_none() {
                        // Nobody can arm it anymore.
                        return reader.read(buf).await;
                    }
                }
            }
        }
    }
}

/// Copy `reader` into `writer` until end-of-stream.
async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    deadline: &mut DeadlineWatch,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match deadline.read(reader, &mut buf).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    return (total, Err(e));
                }
                total += n as u64;
            }
            Err(e) => return (total, Err(e)),
        }
    }
}

/// Half-close `writer` and bound the remaining reads on its connection.
async fn finish_direction<W>(writer: &mut W, arm: &DeadlineArm, linger: Duration)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.shutdown().await {
        // Streams without a half-close are covered by the final drop.
        debug!(error = %e, "Half-close failed");
    }
    arm.arm(linger);
}

/// Aborts the spawned direction if the relay is dropped before joining it.
struct JoinGuard(Option<JoinHandle<()>>);

impl JoinGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for JoinGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// Relay bytes between `client` and `upstream` until both directions finish.
///
/// Both connections are consumed and dropped before this returns, and also
/// when the returned future is dropped early. The byte counts are reported
/// whatever the outcome. On error the inline (upstream→client) error takes
/// precedence; either way the spawned direction has completed.
pub async fn relay<C, U>(client: C, upstream: U, linger: Duration) -> (RelayStats, io::Result<()>)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Deadline on reads from the client, armed after upstream→client ends.
    let (client_arm, mut client_deadline) = read_deadline();
    // Deadline on reads from the upstream, armed after client→upstream ends.
    let (upstream_arm, mut upstream_deadline) = read_deadline();

    let (done_tx, done_rx) = oneshot::channel();
    let guard = JoinGuard(Some(tokio::spawn(async move {
        let (bytes, result) =
            copy_direction(&mut client_read, &mut upstream_write, &mut client_deadline).await;
        finish_direction(&mut upstream_write, &upstream_arm, linger).await;
        drop(client_read);
        drop(upstream_write);
        // The receiver only goes away if the relay itself was dropped.
        let _ = done_tx.send((bytes, result));
    })));

    let (upstream_to_client, inline_result) =
        copy_direction(&mut upstream_read, &mut client_write, &mut upstream_deadline).await;
    finish_direction(&mut client_write, &client_arm, linger).await;
    drop(upstream_read);
    drop(client_write);

    let (client_to_upstream, spawned_result) = done_rx
        .await
        .unwrap_or_else(|_| (0, Err(io::Error::other("relay task aborted"))));
    guard.disarm();

    let stats = RelayStats {
        client_to_upstream,
        upstream_to_client,
    };
    (stats, inline_result.and(spawned_result))
}
