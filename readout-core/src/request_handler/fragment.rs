//! Zero-copy fragment assembly (spec.md §4.5.3).
//!
//! Grounded on `DefaultRequestHandlerModel::get_fragment_pieces`: walks a
//! `lower_bound` iterator positioned at the window start, emitting whole-
//! payload pieces for entries fully inside the window and per-frame pieces
//! for entries straddling an edge. The pieces only borrow latency-buffer
//! memory for the duration of this walk; by the time this returns, the
//! caller has already copied every piece's bytes into the outgoing
//! fragment body, exactly as the original's `Fragment` constructor copies
//! from the piece list it is handed.

use crate::error_registry::{FrameErrorKind, FrameErrorRegistry};
use crate::latency_buffer::{LatencyBuffer, LatencyBufferIterator};
use crate::payload::{FramePiece, Payload};

/// Outcome of a fragment-piece walk.
pub enum PiecesResult {
    /// The window was fully covered; `pieces` is complete.
    Found(Vec<FramePiece>),
    /// The iterator went bad mid-walk (concurrent reclamation); the caller
    /// should retry the whole request as `NotYet` (spec.md §4.5.3).
    Retry,
}

/// Positions `lower_bound(window_begin, has_error(MISSING_FRAMES))` and
/// walks forward while `entry.first_timestamp < window_end`.
pub fn get_fragment_pieces<P, L>(buffer: &L, registry: &FrameErrorRegistry, window_begin: u64, window_end: u64) -> PiecesResult
where
    P: Payload,
    L: LatencyBuffer<P>,
{
    let with_errors = registry.has_error(FrameErrorKind::MissingFrames);
    let mut iter = buffer.lower_bound(window_begin, with_errors);
    if !iter.good() {
        return PiecesResult::Retry;
    }

    let mut pieces = Vec::new();
    while iter.good() {
        let entry = match iter.current() {
            Some(e) => e,
            None => return PiecesResult::Retry,
        };
        if entry.first_timestamp() >= window_end {
            break;
        }

        let tick_diff = P::EXPECTED_TICK_DIFFERENCE;
        let last_frame_ts = entry.first_timestamp() + (entry.num_frames().saturating_sub(1) as u64) * tick_diff;

        if last_frame_ts < window_begin {
            // entirely before the window: skip
        } else if (entry.first_timestamp() < window_begin && last_frame_ts >= window_begin) || last_frame_ts >= window_end {
            // straddles an edge: enumerate individual frames in-window
            for frame_index in 0..entry.num_frames() {
                let ts = entry.frame_timestamp(frame_index);
                if ts >= window_begin && ts < window_end {
                    pieces.push(FramePiece {
                        ptr: entry.frame_ptr(frame_index),
                        len: entry.frame_size(),
                    });
                }
            }
        } else {
            // fully inside the window: one whole-payload piece
            pieces.push(FramePiece {
                ptr: entry.begin(),
                len: entry.payload_size(),
            });
        }

        iter.advance();
    }

    PiecesResult::Found(pieces)
}

/// Copies every piece's bytes into one contiguous body, the last step
/// before a [`FramePiece`] is no longer needed to stay valid (spec.md §9).
///
/// # Safety
/// Every `FramePiece` in `pieces` must still point at live latency-buffer
/// memory; callers hold the request handler's cleanup-protocol guard for
/// the entire span from [`get_fragment_pieces`] through this call.
pub unsafe fn copy_pieces(pieces: &[FramePiece]) -> Vec<u8> {
    let total: usize = pieces.iter().map(|p| p.len).sum();
    let mut body = Vec::with_capacity(total);
    for piece in pieces {
        // SAFETY: see function-level safety note.
        let slice = unsafe { std::slice::from_raw_parts(piece.ptr, piece.len) };
        body.extend_from_slice(slice);
    }
    body
}
