//! Bidirectional byte forwarding between two established connections.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const PUMP_BUFFER: usize = 16 * 1024;

/// Bytes moved in each direction by [`splice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Spliced {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Forwards bytes between `a` and `b` until either direction ends.
///
/// The first pump to hit EOF or an error stops the other one and both
/// connections are shut down.
pub async fn splice<A, B>(a: A, b: B) -> Spliced
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut stats = Spliced::default();

    {
        let forward = pump(&mut a_read, &mut b_write, &mut stats.a_to_b);
        let backward = pump(&mut b_read, &mut a_write, &mut stats.b_to_a);

        tokio::select! {
            result = forward => {
                if let Err(e) = result {
                    debug!("splice a->b ended: {}", e);
                }
            }
            result = backward => {
                if let Err(e) = result {
                    debug!("splice b->a ended: {}", e);
                }
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    stats
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}
