//! Transport-specific encode/decode helpers layered on top of [`Message`]:
//! TCP length-prefixed framing (RFC 1035 §4.2.2) and DoH's base64url GET
//! parameter (RFC 8484).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, Result};

use super::message::Message;

pub const MAX_FRAME_LEN: usize = 65535;

pub fn decode(bytes: &[u8]) -> Result<Message> {
    Message::decode(bytes)
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    msg.encode()
}

/// Reads one 2-byte-length-prefixed DNS message. A length of 0 is rejected;
/// reads are always full reads (no short-read tolerance per §4.1).
pub async fn read_tcp_framed<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(AppError::decode("zero-length TCP frame"));
    }
    if len > MAX_FRAME_LEN {
        return Err(AppError::decode("oversized TCP frame"));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    decode(&body)
}

/// Like [`read_tcp_framed`] but returns `Ok(None)` for a zero-length frame
/// instead of erroring, for STCP inbounds where a zero frame is a keepalive
/// ping rather than a malformed message (§4.8).
pub async fn read_tcp_framed_allow_ping<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(AppError::decode("oversized TCP frame"));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(decode(&body)?))
}

pub async fn write_tcp_framed<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> Result<()> {
    let body = encode(msg)?;
    if body.is_empty() || body.len() > MAX_FRAME_LEN {
        return Err(AppError::decode("message does not fit in a TCP frame"));
    }
    let len = (body.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&body).await?;
    Ok(())
}

/// Writes a 2-byte zero-length frame: the STCP keepalive ping.
pub async fn write_ping_frame<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<()> {
    stream.write_all(&[0u8, 0u8]).await?;
    Ok(())
}

/// Decodes the `dns` query parameter of a DoH GET request: base64url without
/// padding.
pub fn decode_doh_get(query_value: &str) -> Result<Message> {
    let bytes = URL_SAFE_NO_PAD
        .decode(query_value)
        .map_err(|e| AppError::decode(format!("invalid base64url dns param: {e}")))?;
    decode(&bytes)
}

pub fn encode_doh_get(msg: &Message) -> Result<String> {
    let bytes = encode(msg)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::question::Name;
    use crate::dns::RecordType;

    fn sample_query() -> Message {
        Message::new_query(1234, &Name::parse("example.com."), RecordType::A)
    }

    #[tokio::test]
    async fn tcp_framing_round_trips() {
        let query = sample_query();
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_tcp_framed(&mut client, &query).await.unwrap();
        let decoded = read_tcp_framed(&mut server).await.unwrap();
        assert_eq!(decoded, query);
    }

    #[tokio::test]
    async fn zero_length_tcp_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(16);
        use tokio::io::AsyncWriteExt;
        client.write_all(&[0u8, 0u8]).await.unwrap();
        assert!(read_tcp_framed(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn zero_length_tcp_frame_is_a_ping_in_allow_ping_mode() {
        let (mut client, mut server) = tokio::io::duplex(16);
        use tokio::io::AsyncWriteExt;
        client.write_all(&[0u8, 0u8]).await.unwrap();
        assert_eq!(read_tcp_framed_allow_ping(&mut server).await.unwrap(), None);
    }

    #[test]
    fn doh_get_param_round_trips() {
        let query = sample_query();
        let encoded = encode_doh_get(&query).unwrap();
        let decoded = decode_doh_get(&encoded).unwrap();
        assert_eq!(decoded, query);
    }

    #[test]
    fn doh_get_rejects_invalid_base64() {
        assert!(decode_doh_get("not valid base64url!!").is_err());
    }
}
