//! Chunk interleaving and the shared output file.
//!
//! In multi-track recordings each puller thread seals groups of
//! samples into chunks and submits them here. A dedicated writer
//! thread drains the queues into the file, always picking the queued
//! chunk with the earliest starting timestamp so that audio and video
//! stay interleaved on disk. The writer only commits to an ordering
//! decision once every still-active track has a chunk queued.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::MuxResult;
use crate::mp4::StscEntry;
use crate::muxer::MuxerEvent;

/// Append-only view of the output file with an explicit write cursor.
///
/// The cursor is kept by the struct instead of being re-queried so that
/// patch writes (box sizes, moov relocation) can seek away and restore
/// it. Invariant: the file position equals `pos` between calls.
pub(crate) struct Output {
    file: File,
    pos: u64,
}

impl Output {
    pub fn new(mut file: File) -> MuxResult<Self> {
        let pos = file.stream_position()?;
        Ok(Self { file, pos })
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Append bytes at the cursor, returning the offset they start at.
    pub fn append(&mut self, data: &[u8]) -> MuxResult<u64> {
        let at = self.pos;
        self.file.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(at)
    }

    /// Overwrite bytes at an absolute offset, restoring the cursor.
    pub fn patch_at(&mut self, at: u64, data: &[u8]) -> MuxResult<()> {
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_all(data)?;
        self.file.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    pub fn patch_u32(&mut self, at: u64, value: u32) -> MuxResult<()> {
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_u32::<BigEndian>(value)?;
        self.file.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }

    pub fn patch_u64(&mut self, at: u64, value: u64) -> MuxResult<()> {
        self.file.seek(SeekFrom::Start(at))?;
        self.file.write_u64::<BigEndian>(value)?;
        self.file.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }
}

/// A sealed group of consecutive samples from one track, written to the
/// file as one contiguous run.
pub(crate) struct Chunk {
    pub track_index: usize,
    /// Timestamp of the first sample, used as the interleaving sort key.
    pub first_ts_us: i64,
    /// Sample payloads, already in storage framing.
    pub samples: Vec<Vec<u8>>,
}

/// Per-track record of where chunks landed, kept by whichever thread
/// performs the actual writes and merged into the sample tables at stop.
#[derive(Default)]
pub(crate) struct ChunkLog {
    pub offsets: Vec<u64>,
    pub sample_to_chunk: Vec<StscEntry>,
}

impl ChunkLog {
    /// Record a written chunk; opens a new stsc run when the
    /// samples-per-chunk count changes.
    pub fn record_chunk(&mut self, offset: u64, sample_count: u32) {
        self.offsets.push(offset);
        let chunk_number = self.offsets.len() as u32;
        if self.sample_to_chunk.last().map(|e| e.samples_per_chunk) != Some(sample_count) {
            self.sample_to_chunk.push(StscEntry {
                first_chunk: chunk_number,
                samples_per_chunk: sample_count,
            });
        }
    }
}

struct Slot {
    queue: VecDeque<Chunk>,
    done: bool,
}

struct QueueState {
    slots: Vec<Slot>,
}

enum Action {
    Take(usize),
    Wait,
    Exit,
}

/// Chunk queues for all tracks plus the writer thread's wakeup signal.
pub(crate) struct ChunkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl ChunkQueue {
    pub fn new(track_count: usize) -> Self {
        let slots = (0..track_count)
            .map(|_| Slot {
                queue: VecDeque::new(),
                done: false,
            })
            .collect();
        Self {
            state: Mutex::new(QueueState { slots }),
            available: Condvar::new(),
        }
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Queue a sealed chunk from a puller thread.
    pub fn submit(&self, chunk: Chunk) {
        let mut state = self.state.lock();
        state.slots[chunk.track_index].queue.push_back(chunk);
        self.available.notify_all();
    }

    /// Mark a track as finished; it no longer gates ordering decisions.
    pub fn mark_done(&self, track_index: usize) {
        let mut state = self.state.lock();
        state.slots[track_index].done = true;
        self.available.notify_all();
    }

    /// Block until a chunk can be written, or return `None` once every
    /// track is done and drained.
    fn next_chunk(&self) -> Option<Chunk> {
        let mut state = self.state.lock();
        loop {
            match Self::decide(&state) {
                Action::Take(index) => return state.slots[index].queue.pop_front(),
                Action::Exit => return None,
                Action::Wait => self.available.wait(&mut state),
            }
        }
    }

    fn decide(state: &QueueState) -> Action {
        if state.slots.iter().all(|s| s.done) {
            // Final drain: flush leftovers in track order.
            for (index, slot) in state.slots.iter().enumerate() {
                if !slot.queue.is_empty() {
                    return Action::Take(index);
                }
            }
            return Action::Exit;
        }

        // An active track with nothing queued could still produce the
        // earliest chunk, so hold off until all of them have one.
        if state.slots.iter().any(|s| !s.done && s.queue.is_empty()) {
            return Action::Wait;
        }

        let mut best: Option<(usize, i64)> = None;
        for (index, slot) in state.slots.iter().enumerate() {
            if let Some(front) = slot.queue.front() {
                match best {
                    Some((_, ts)) if front.first_ts_us >= ts => {}
                    _ => best = Some((index, front.first_ts_us)),
                }
            }
        }
        match best {
            Some((index, _)) => Action::Take(index),
            None => Action::Wait,
        }
    }
}

/// Result handed back when the writer thread is joined.
pub(crate) struct WriterOutcome {
    pub logs: Vec<ChunkLog>,
    pub status: MuxResult<()>,
}

/// Writer thread body: drain chunks into the file until all tracks
/// finish, recording chunk offsets as they become known.
pub(crate) fn run_writer(
    queue: Arc<ChunkQueue>,
    output: Arc<Mutex<Output>>,
    events: Sender<MuxerEvent>,
) -> WriterOutcome {
    let track_count = queue.track_count();
    let mut logs: Vec<ChunkLog> = (0..track_count).map(|_| ChunkLog::default()).collect();
    let mut status = Ok(());

    while let Some(chunk) = queue.next_chunk() {
        match write_chunk(&output, &chunk) {
            Ok(offset) => {
                debug!(
                    track_index = chunk.track_index,
                    offset,
                    samples = chunk.samples.len(),
                    "Wrote chunk"
                );
                logs[chunk.track_index].record_chunk(offset, chunk.samples.len() as u32);
            }
            Err(e) => {
                error!(track_index = chunk.track_index, error = %e, "Chunk write failed");
                let _ = events.send(MuxerEvent::Fatal {
                    message: e.to_string(),
                });
                status = Err(e);
                break;
            }
        }
    }

    WriterOutcome { logs, status }
}

fn write_chunk(output: &Mutex<Output>, chunk: &Chunk) -> MuxResult<u64> {
    let mut out = output.lock();
    let offset = out.position();
    for sample in &chunk.samples {
        out.append(sample)?;
    }
    Ok(offset)
}
