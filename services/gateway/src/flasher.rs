//! The OTA flasher state machine.
//!
//! Pure state: the session actor owns the socket and feeds the flasher the
//! device's `UpdateReady` / `ChunkReceived` replies; the flasher answers
//! with the next action to perform. That keeps chunking, CRC verification,
//! and retransmit accounting testable without any I/O.
//!
//! Phases: PREPARING → BEGIN_SENT → READY_RECEIVED → SENDING_CHUNKS ⇄
//! AWAITING_CHUNK_ACK → DONE | FAILED.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlashError {
    #[error("firmware image is empty")]
    Empty,
    #[error("firmware image of {size} bytes exceeds the {max} byte limit")]
    Oversize { size: usize, max: usize },
    #[error("chunk {index} failed CRC verification after {retries} retries")]
    CrcExhausted { index: usize, retries: u32 },
    #[error("unknown firmware app '{0}'")]
    UnknownApp(String),
    #[error("flash interrupted: {0}")]
    Interrupted(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPhase {
    Preparing,
    BeginSent,
    ReadyReceived,
    SendingChunks,
    AwaitingChunkAck,
    Done,
    Failed,
}

/// What the session should do next on the flasher's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAction {
    /// Send `UpdateBegin` and await `UpdateReady`.
    SendBegin,
    /// Send chunk `index` and await its `ChunkReceived`.
    SendChunk { index: usize },
    /// Every chunk is acknowledged: send `UpdateDone`; the flash succeeded.
    SendDone,
}

#[derive(Debug)]
pub struct Flasher {
    chunks: Vec<Vec<u8>>,
    binary_len: usize,
    chunk_size: usize,
    index: usize,
    retries_used: u32,
    max_retries: u32,
    phase: FlashPhase,
}

impl Flasher {
    /// Validate and chunk a firmware image.
    ///
    /// The image must be non-empty and at most `max_binary_size` bytes. It
    /// is split into `chunk_size`-byte chunks, the last zero-padded to the
    /// chunk boundary.
    pub fn new(
        binary: &[u8],
        max_binary_size: usize,
        chunk_size: usize,
        max_retries: u32,
    ) -> Result<Flasher, FlashError> {
        if binary.is_empty() {
            return Err(FlashError::Empty);
        }
        if binary.len() > max_binary_size {
            return Err(FlashError::Oversize {
                size: binary.len(),
                max: max_binary_size,
            });
        }
        let chunks = binary
            .chunks(chunk_size)
            .map(|chunk| {
                let mut padded = chunk.to_vec();
                padded.resize(chunk_size, 0);
                padded
            })
            .collect();
        Ok(Flasher {
            chunks,
            binary_len: binary.len(),
            chunk_size,
            index: 0,
            retries_used: 0,
            max_retries,
            phase: FlashPhase::Preparing,
        })
    }

    pub fn phase(&self) -> FlashPhase {
        self.phase
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn binary_len(&self) -> usize {
        self.binary_len
    }

    pub fn chunk(&self, index: usize) -> &[u8] {
        &self.chunks[index]
    }

    /// `UpdateBegin` payload: image length (u32 LE) then chunk size (u16 LE).
    pub fn begin_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&(self.binary_len as u32).to_le_bytes());
        payload.extend_from_slice(&(self.chunk_size as u16).to_le_bytes());
        payload
    }

    /// Kick off the transfer.
    pub fn begin(&mut self) -> FlashAction {
        self.phase = FlashPhase::BeginSent;
        FlashAction::SendBegin
    }

    /// The device accepted `UpdateBegin`.
    pub fn on_update_ready(&mut self) -> FlashAction {
        self.phase = FlashPhase::ReadyReceived;
        self.next_chunk()
    }

    /// The device acknowledged the in-flight chunk with its CRC32.
    ///
    /// A matching CRC advances to the next chunk; a mismatch retransmits
    /// the same chunk until retries are exhausted.
    pub fn on_chunk_received(&mut self, crc: u32) -> Result<FlashAction, FlashError> {
        let expected = cl_crypto::crc32(&self.chunks[self.index]);
        if crc == expected {
            self.index += 1;
            self.retries_used = 0;
            Ok(self.next_chunk())
        } else if self.retries_used < self.max_retries {
            self.retries_used += 1;
            self.phase = FlashPhase::SendingChunks;
            Ok(FlashAction::SendChunk { index: self.index })
        } else {
            self.phase = FlashPhase::Failed;
            Err(FlashError::CrcExhausted {
                index: self.index,
                retries: self.max_retries,
            })
        }
    }

    /// Mark the transfer failed (timeout, abort, disconnect).
    pub fn fail(&mut self) {
        self.phase = FlashPhase::Failed;
    }

    fn next_chunk(&mut self) -> FlashAction {
        if self.index < self.chunks.len() {
            self.phase = FlashPhase::AwaitingChunkAck;
            FlashAction::SendChunk { index: self.index }
        } else {
            self.phase = FlashPhase::Done;
            FlashAction::SendDone
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
