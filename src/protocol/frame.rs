//! Length-prefixed stream framing.
//!
//! ```text
//! +----------------+----------------------------+-----------------+
//! | head_len: u64  | head: JSON FrameHead       | body            |
//! | big-endian     | {"cmd":u32,"body_len":u32} | body_len bytes  |
//! +----------------+----------------------------+-----------------+
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of the head length prefix.
pub const HEAD_LEN_SIZE: usize = 8;
/// Longest head accepted; anything above is a corrupt stream.
pub const MAX_HEAD_LEN: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHead {
    pub cmd: u32,
    pub body_len: u32,
}

pub fn encode_frame(cmd: u32, body: &[u8]) -> Result<Vec<u8>> {
    let body_len = u32::try_from(body.len())
        .map_err(|_| Error::InvalidArgument("frame body longer than u32::MAX"))?;
    let head = serde_json::to_vec(&FrameHead { cmd, body_len })
        .map_err(|e| Error::Parse(e.to_string()))?;

    let mut frame = Vec::with_capacity(HEAD_LEN_SIZE + head.len() + body.len());
    frame.extend_from_slice(&(head.len() as u64).to_be_bytes());
    frame.extend_from_slice(&head);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Dispatches every complete frame in `data`, in order.
///
/// Returns the number of bytes taken by whole frames; a trailing partial
/// frame is left for the next call. A corrupt head fails with
/// [`Error::Parse`]; an error from `on_frame` is returned as is.
pub fn decode_frames<F>(data: &[u8], mut on_frame: F) -> anyhow::Result<usize>
where
    F: FnMut(u32, &[u8]) -> anyhow::Result<()>,
{
    let mut pos = 0;
    loop {
        let rest = &data[pos..];
        let Some(prefix) = rest.get(..HEAD_LEN_SIZE) else {
            break;
        };
        let mut len = [0u8; HEAD_LEN_SIZE];
        len.copy_from_slice(prefix);
        let head_len = u64::from_be_bytes(len);
        if head_len == 0 || head_len > MAX_HEAD_LEN {
            return Err(Error::Parse(format!("frame head length {head_len} out of range")).into());
        }

        let head_end = HEAD_LEN_SIZE + head_len as usize;
        let Some(head) = rest.get(HEAD_LEN_SIZE..head_end) else {
            break;
        };
        let head: FrameHead =
            serde_json::from_slice(head).map_err(|e| Error::Parse(e.to_string()))?;

        let frame_end = head_end + head.body_len as usize;
        let Some(body) = rest.get(head_end..frame_end) else {
            break;
        };
        on_frame(head.cmd, body)?;
        pos += frame_end;
    }
    Ok(pos)
}
