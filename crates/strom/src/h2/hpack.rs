//! The header-compression seam.
//!
//! Entropy coding lives in `loona-hpack`; this module only deals with what
//! HTTP/2 framing needs from it: per-frame byte budgets, dynamic table size
//! updates, and block boundaries.

use bytes::Bytes;
use loona_hpack::{decoder::DecoderError, encoder::encode_integer_into};
use tracing::{debug, trace};

/// Largest dynamic table our encoder will ever use, whatever the peer allows
pub const MAX_ENCODER_TABLE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeProgress {
    /// The whole block has been handed out
    Done,
    /// More bytes remain, call `continue_encode`
    Partial,
}

pub trait HeaderBlockEncoder {
    /// Encode a full field list, returning at most `budget` bytes of it.
    fn begin_encode(
        &mut self,
        fields: &[(&[u8], &[u8])],
        budget: usize,
    ) -> std::io::Result<(Bytes, EncodeProgress)>;

    /// Return the next `budget` bytes of the block started by `begin_encode`
    fn continue_encode(&mut self, budget: usize) -> (Bytes, EncodeProgress);

    /// The peer's SETTINGS_HEADER_TABLE_SIZE changed
    fn set_max_table_size(&mut self, size: usize);
}

pub trait HeaderBlockDecoder {
    /// Feed a header block fragment. Fields are reported through `on_field`
    /// once `end_headers` is true.
    fn decode(
        &mut self,
        fragment: &[u8],
        end_headers: bool,
        on_field: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<(), DecoderError>;

    /// The SETTINGS_HEADER_TABLE_SIZE we advertised
    fn set_max_table_size(&mut self, size: usize);
}

pub struct HpackEncoder {
    inner: loona_hpack::Encoder<'static>,
    /// Size the peer's decoder last heard about
    table_size: usize,
    /// Smallest and final size requested since the last block
    size_update: Option<TableSizeUpdate>,
    pending: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct TableSizeUpdate {
    smallest: usize,
    last: usize,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self {
            inner: loona_hpack::Encoder::new(),
            table_size: MAX_ENCODER_TABLE_SIZE,
            size_update: None,
            pending: Bytes::new(),
        }
    }
}

impl HpackEncoder {
    /// Emits the dynamic table size updates owed to the peer, cf. RFC 7541,
    /// section 4.2: the smallest size seen first if it was never announced,
    /// then the final one.
    fn write_size_updates(&mut self, block: &mut Vec<u8>) -> std::io::Result<()> {
        let Some(TableSizeUpdate { smallest, last }) = self.size_update.take() else {
            return Ok(());
        };

        if smallest < last {
            trace!(%smallest, "prefixing block with intermediate table size update");
            self.inner.set_max_table_size(smallest);
            encode_integer_into(smallest, 5, 0x20, block)?;
        }
        if smallest < last || last != self.table_size {
            trace!(size = %last, "prefixing block with dynamic table size update");
            self.inner.set_max_table_size(last);
            encode_integer_into(last, 5, 0x20, block)?;
        }
        self.table_size = last;
        Ok(())
    }
}

impl HeaderBlockEncoder for HpackEncoder {
    fn begin_encode(
        &mut self,
        fields: &[(&[u8], &[u8])],
        budget: usize,
    ) -> std::io::Result<(Bytes, EncodeProgress)> {
        debug_assert!(
            self.pending.is_empty(),
            "begin_encode called with {} bytes of a previous block pending",
            self.pending.len()
        );

        let mut block = Vec::new();
        self.write_size_updates(&mut block)?;
        self.inner.encode_into(fields.iter().copied(), &mut block)?;
        self.pending = block.into();

        Ok(self.continue_encode(budget))
    }

    fn continue_encode(&mut self, budget: usize) -> (Bytes, EncodeProgress) {
        let n = budget.min(self.pending.len());
        let chunk = self.pending.split_to(n);
        let progress = if self.pending.is_empty() {
            EncodeProgress::Done
        } else {
            EncodeProgress::Partial
        };
        (chunk, progress)
    }

    fn set_max_table_size(&mut self, size: usize) {
        let size = size.min(MAX_ENCODER_TABLE_SIZE);
        let update = match self.size_update {
            Some(update) => TableSizeUpdate {
                smallest: update.smallest.min(size),
                last: size,
            },
            None if size == self.table_size => return,
            None => TableSizeUpdate {
                smallest: size,
                last: size,
            },
        };
        debug!(old = %self.table_size, new = %size, "encoder dynamic table resized");
        self.size_update = Some(update);
    }
}

pub struct HpackDecoder {
    inner: loona_hpack::Decoder<'static>,
    partial: Vec<u8>,
}

impl HpackDecoder {
    pub fn new(max_table_size: usize) -> Self {
        let mut inner = loona_hpack::Decoder::new();
        inner.set_max_allowed_table_size(max_table_size);
        Self {
            inner,
            partial: Vec::new(),
        }
    }
}

impl HeaderBlockDecoder for HpackDecoder {
    fn decode(
        &mut self,
        fragment: &[u8],
        end_headers: bool,
        on_field: &mut dyn FnMut(&[u8], &[u8]),
    ) -> Result<(), DecoderError> {
        if !end_headers {
            self.partial.extend_from_slice(fragment);
            return Ok(());
        }

        let cb = |name: std::borrow::Cow<[u8]>, value: std::borrow::Cow<[u8]>| {
            on_field(&name, &value)
        };
        if self.partial.is_empty() {
            self.inner.decode_with_cb(fragment, cb)
        } else {
            let mut block = std::mem::take(&mut self.partial);
            block.extend_from_slice(fragment);
            self.inner.decode_with_cb(&block, cb)
        }
    }

    fn set_max_table_size(&mut self, size: usize) {
        self.inner.set_max_allowed_table_size(size);
    }
}
