//! Option negotiation: the JSON preamble exchanged on every connection.
//!
//! The client writes one JSON-encoded [`Options`] value, newline-terminated,
//! before any codec frames. The server reads exactly that line, so the
//! codec's first frame is never swallowed by handshake buffering. The magic
//! number identifies the protocol; the codec selector picks the wire format
//! for everything after the preamble.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{WireFormat, POSTCARD_SELECTOR};

/// Protocol sentinel carried in every handshake.
pub const MAGIC_NUMBER: u32 = 0x2a;

/// Default client-side dial budget.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake preamble; never altered mid-connection.
///
/// Serialized field names match the wire contract
/// (`MagicNumber`/`CodecType`/`ConnectTimeout`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    /// Must equal [`MAGIC_NUMBER`]; the server silently closes otherwise.
    pub magic_number: u32,
    /// Codec selector key, e.g. `"application/postcard"`.
    pub codec_type: String,
    /// Client-side dial budget; zero disables the connect race.
    pub connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: POSTCARD_SELECTOR.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Options {
    /// Default options with a different codec selector.
    pub fn with_codec(selector: &str) -> Self {
        Self {
            codec_type: selector.to_string(),
            ..Self::default()
        }
    }

    /// Resolve the codec selector, if it names a known wire format.
    pub fn wire_format(&self) -> Option<WireFormat> {
        WireFormat::from_selector(&self.codec_type)
    }
}

/// Write the newline-terminated option preamble.
pub(crate) async fn write_options<W>(io: &mut W, options: &Options) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(options)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    line.push(b'\n');
    io.write_all(&line).await?;
    io.flush().await
}

/// Read one option preamble line.
pub(crate) async fn read_options<R>(io: &mut R) -> std::io::Result<Options>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = io.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    serde_json::from_slice(&line)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}
