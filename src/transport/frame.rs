//! Stream framing for byte-stream transports.
//!
//! `[tag: u8][length: u32 BE][payload]`, tag 0 for text and 1 for binary.

use super::Frame;
use crate::utils::{ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const TAG_TEXT: u8 = 0;
const TAG_BINARY: u8 = 1;
const HEADER_LEN: usize = 5;

/// Encode a frame into its wire form
pub fn encode(frame: &Frame) -> Vec<u8> {
    let (tag, payload) = match frame {
        Frame::Text(text) => (TAG_TEXT, text.as_bytes()),
        Frame::Binary(bytes) => (TAG_BINARY, bytes.as_slice()),
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(frame)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > max_size {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: max_size,
        }
        .into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    match header[0] {
        TAG_TEXT => String::from_utf8(payload)
            .map(|text| Some(Frame::Text(text)))
            .map_err(|_| {
                ProtocolError::InvalidMessage {
                    reason: "text frame is not UTF-8".to_string(),
                }
                .into()
            }),
        TAG_BINARY => Ok(Some(Frame::Binary(payload))),
        tag => Err(ProtocolError::InvalidMessage {
            reason: format!("unknown frame tag {tag}"),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Frame::Text("{\"type\":\"x\"}".into()))
            .await
            .unwrap();
        write_frame(&mut a, &Frame::Binary(vec![0xAB; 300])).await.unwrap();
        drop(a);

        assert_eq!(
            read_frame(&mut b, 1024).await.unwrap(),
            Some(Frame::Text("{\"type\":\"x\"}".into()))
        );
        assert_eq!(
            read_frame(&mut b, 1024).await.unwrap(),
            Some(Frame::Binary(vec![0xAB; 300]))
        );
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &Frame::Binary(vec![1; 100])).await.unwrap();

        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(
            err,
            crate::utils::PeerwayError::Protocol(ProtocolError::MessageTooLarge { size: 100, max: 64 })
        ));
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&Frame::Text("hi".into()));
        assert_eq!(bytes, vec![0, 0, 0, 0, 2, b'h', b'i']);
    }
}
