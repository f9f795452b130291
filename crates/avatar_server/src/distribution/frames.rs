use crate::cache::AvatarRecord;
use crate::protocol::ServerMessage;

/// Splits an avatar into chunk frames of at most `max_frame_size` payload
/// bytes followed by the completion frame. An empty payload still yields a
/// single (empty) chunk so clients see the usual sequence.
pub fn avatar_frames(record: &AvatarRecord, max_frame_size: usize) -> Vec<ServerMessage> {
    let max = max_frame_size.max(1);
    let size = record.payload.len();
    let total = size.div_ceil(max).max(1);

    let mut frames = Vec::with_capacity(total + 1);
    for seq in 0..total {
        let start = seq * max;
        let end = (start + max).min(size);
        frames.push(ServerMessage::AvatarChunk {
            owner: record.key.owner.clone(),
            version: record.key.version,
            seq: seq as u32,
            total: total as u32,
            hash: record.hash,
            data: record.payload.slice(start..end),
        });
    }

    frames.push(ServerMessage::AvatarComplete {
        owner: record.key.owner.clone(),
        version: record.key.version,
        hash: record.hash,
        size: size as u64,
    });
    frames
}
