//! # Command Dialect
//!
//! The only words the batch layer ever interprets: the no-op used for
//! padding and the end marker that terminates a stream. Everything else is
//! opaque payload copied verbatim.

bitflags::bitflags! {
    /// Read/write domain hints attached to a relocation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Domains: u32 {
        /// CPU
        const CPU = 1 << 0;
        /// Render target
        const RENDER = 1 << 1;
        /// Sampler
        const SAMPLER = 1 << 2;
        /// Command streamer
        const COMMAND = 1 << 3;
        /// Instruction fetch
        const INSTRUCTION = 1 << 4;
        /// Vertex fetch
        const VERTEX = 1 << 5;
    }
}

/// Padding and termination words for one hardware family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    /// No-op word used for alignment padding
    pub noop: u32,
    /// End-of-stream marker
    pub end: u32,
    /// Alignment, in words, applied after the end marker
    pub end_align: usize,
}

impl Dialect {
    /// MI_NOOP / MI_BATCH_BUFFER_END style encoding
    pub const MI: Dialect = Dialect {
        noop: 0,
        end: 0x0A << 23,
        end_align: 2,
    };

    /// Whether `words` terminates with the end marker
    ///
    /// Padding no-ops after the marker are allowed.
    pub fn is_terminated(&self, words: &[u32]) -> bool {
        words
            .iter()
            .rev()
            .find(|w| **w != self.noop)
            .map_or(false, |w| *w == self.end)
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Self::MI
    }
}
