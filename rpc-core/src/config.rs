// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Ambient runtime configuration, in the style of the teacher's
//! `server::Config` (not part of spec.md's module list; see SPEC_FULL.md §2).

/// Tunables for a [`crate::channel::Channel`]/[`crate::channel::SequencedChannel`]
/// pair. Mirrors the teacher's pattern of a small config struct with a
/// `Default` impl carrying the tuned constant, rather than scattering magic
/// numbers through the channel/sink code.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Upper bound on how many outbound requests may sit in
    /// [`crate::sink::ChannelSink`]'s outgoing table awaiting a response at
    /// once. `push` does not currently enforce this (spec §1's "no
    /// backpressure beyond the transport" non-goal) — it's surfaced so an
    /// embedder can build a bounded stub generator on top.
    pub pending_response_buffer: usize,

    /// Frames at or below this size are assembled into one contiguous
    /// buffer before a single write; larger ones stream directly into the
    /// transport's write buffer (spec §4.1).
    pub max_in_memory_frame_size: usize,

    /// Chunk size used by [`crate::sequence::SequencedConnection`] when
    /// wrapping a [`crate::channel::SequencedChannel`]'s outbound writes.
    pub fragment_chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pending_response_buffer: 100,
            max_in_memory_frame_size: crate::base_packet::MAX_IN_MEMORY_FRAME_SIZE,
            fragment_chunk_size: 16 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_tuned_constants() {
        let config = Config::default();
        assert_eq!(config.pending_response_buffer, 100);
        assert_eq!(config.max_in_memory_frame_size, 100 * 1024);
    }
}
