//! Gossip frame encoding: one header byte selecting plain or
//! LZ4-compressed JSON, auto-detected by the receiver.

use anyhow::{Context, Result};

use crate::types::GossipFrame;

pub const HEADER_PLAIN: u8 = 0x00;
pub const HEADER_LZ4: u8 = 0x01;

/// Serialize a frame. Bodies above the threshold are LZ4-compressed,
/// but only when compression actually wins.
pub fn encode_frame(frame: &GossipFrame, compression_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(frame).context("Failed to serialize gossip frame")?;

    if json.len() >= compression_threshold {
        let compressed = lz4_flex::compress_prepend_size(&json);
        if compressed.len() < json.len() {
            let mut body = Vec::with_capacity(1 + compressed.len());
            body.push(HEADER_LZ4);
            body.extend_from_slice(&compressed);
            return Ok(body);
        }
    }

    let mut body = Vec::with_capacity(1 + json.len());
    body.push(HEADER_PLAIN);
    body.extend_from_slice(&json);
    Ok(body)
}

pub fn decode_frame(bytes: &[u8]) -> Result<GossipFrame> {
    let (header, body) = bytes
        .split_first()
        .context("Empty gossip body")?;

    let json = match *header {
        HEADER_PLAIN => body.to_vec(),
        HEADER_LZ4 => lz4_flex::decompress_size_prepended(body)
            .context("Failed to decompress gossip body")?,
        other => anyhow::bail!("Unknown gossip compression header: {other:#04x}"),
    };

    serde_json::from_slice(&json).context("Failed to parse gossip frame")
}
