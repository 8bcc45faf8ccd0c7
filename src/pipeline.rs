//! Concurrent block compression pipeline.
//!
//! Callers stream a file's bytes through [`Pipeline::begin_file`], [`Pipeline::append`]
//! and [`Pipeline::end_file`] instead of buffering the whole file: `append` submits
//! each full block to the worker pool as soon as the per-file assembly buffer fills,
//! so a slow compressor working on file N's blocks overlaps with the writer reading
//! and submitting file N+1's blocks, instead of the two being serialized. Blocks are
//! compressed out of order but handed back to the caller strictly in submission order
//! (a min-heap keyed by sequence number) so the on-disk layout stays deterministic and
//! dedup fingerprints land at reproducible offsets. Each worker gets its own [`Codec`]
//! clone (codecs are not required to be thread-safe internally).
//!
//! Backpressure is cross-file: [`Pipeline::submit_block`] blocks once `backlog_limit`
//! jobs are in flight regardless of which file they belong to, so memory use is
//! bounded by `backlog_limit * block_size`, not by the size of any one file.

use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};

use bitflags::bitflags;
use rayon::ThreadPool;
use tracing::{instrument, warn};

use crate::block::{fingerprint, is_all_zero, CompletedBlock};
use crate::codec::Codec;
use crate::error::BackhandError;

pub const MAX_BACKLOG_FACTOR: usize = 10;

bitflags! {
    /// Per-block/per-file submission flags, named after the block processor API in
    /// spec.md §4.4.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BlockFlags: u8 {
        /// Store this block's bytes as-is; skip the codec entirely.
        const DONT_COMPRESS = 0b0001;
        /// A file's tail never becomes a fragment; it is submitted as its own block.
        const DONT_FRAGMENT = 0b0010;
        /// Pad to the device block size before this block is appended.
        const ALIGN         = 0b0100;
        /// Skip all-zero sparse-hole detection for this file's blocks.
        const IGNORE_SPARSE = 0b1000;
    }
}

struct Job {
    sequence: u64,
    data: Vec<u8>,
    flags: BlockFlags,
}

/// A finished job, ordered by sequence number ascending so a `BinaryHeap` (a
/// max-heap) can be used as a min-heap via an inverted `Ord`.
struct Ready {
    sequence: u64,
    result: Result<CompletedBlock, String>,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}
impl Eq for Ready {}
impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Ready {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // inverted so BinaryHeap pops the *smallest* sequence number first
        other.sequence.cmp(&self.sequence)
    }
}

struct State {
    heap: BinaryHeap<Ready>,
    backlog: usize,
    next_enqueue: u64,
    next_dequeue: u64,
    poisoned: bool,
}

/// Shared between the pipeline handle and every worker closure.
struct Shared {
    state: Mutex<State>,
    backlog_cond: Condvar,
    done_cond: Condvar,
}

pub struct Pipeline {
    pool: ThreadPool,
    shared: Arc<Shared>,
    codec_template: Box<dyn Codec>,
    backlog_limit: usize,
}

/// Per-file assembly buffer handed out by [`Pipeline::begin_file`]. Holds at most one
/// not-yet-full block's worth of bytes; everything else has already been submitted.
pub struct FileAssembly {
    buffer: Vec<u8>,
    flags: BlockFlags,
    /// One entry per full block submitted so far, in file order. `None` marks an
    /// all-zero block that was recognized as a sparse hole and never submitted.
    sequences: Vec<Option<u64>>,
}

/// The result of sealing a [`FileAssembly`] with [`Pipeline::end_file`].
pub struct EndedFile {
    pub sequences: Vec<Option<u64>>,
    /// Bytes left over that didn't fill a whole block (the fragment-tail candidate).
    pub tail: Vec<u8>,
    pub flags: BlockFlags,
}

impl Pipeline {
    pub fn new(codec: Box<dyn Codec>, num_workers: usize) -> Result<Self, BackhandError> {
        let num_workers = num_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("sqfsbuild-block-{i}"))
            .build()
            .map_err(|_| BackhandError::AllocFailure("block pipeline thread pool"))?;

        Ok(Self {
            pool,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    backlog: 0,
                    next_enqueue: 0,
                    next_dequeue: 0,
                    poisoned: false,
                }),
                backlog_cond: Condvar::new(),
                done_cond: Condvar::new(),
            }),
            codec_template: codec,
            backlog_limit: num_workers * MAX_BACKLOG_FACTOR,
        })
    }

    /// Open a new per-file assembly buffer. `flags` apply to every block this file
    /// submits, including its fragment tail.
    pub fn begin_file(&self, flags: BlockFlags) -> FileAssembly {
        FileAssembly {
            buffer: Vec::new(),
            flags,
            sequences: Vec::new(),
        }
    }

    /// Feed more of a file's bytes into its assembly buffer. Any full `block_size`
    /// chunks accumulated are submitted to the worker pool immediately; at most one
    /// partial block's worth of data is ever held in memory for this file.
    #[instrument(skip_all)]
    pub fn append(
        &self,
        file: &mut FileAssembly,
        data: &[u8],
        block_size: usize,
    ) -> Result<(), BackhandError> {
        file.buffer.extend_from_slice(data);
        while file.buffer.len() >= block_size {
            let chunk: Vec<u8> = file.buffer.drain(..block_size).collect();
            self.submit_assembled(file, chunk)?;
        }
        Ok(())
    }

    fn submit_assembled(&self, file: &mut FileAssembly, chunk: Vec<u8>) -> Result<(), BackhandError> {
        if !file.flags.contains(BlockFlags::IGNORE_SPARSE) && is_all_zero(&chunk) {
            file.sequences.push(None);
            return Ok(());
        }
        let sequence = self.submit_block(chunk, file.flags)?;
        file.sequences.push(Some(sequence));
        Ok(())
    }

    /// Seal a file's assembly buffer, returning the sequence numbers assigned to its
    /// full blocks plus whatever bytes didn't fill a final block (the caller decides
    /// whether those become a fragment-table tail or, under `DONT_FRAGMENT`, their
    /// own block via [`Pipeline::submit_block`]).
    pub fn end_file(&self, mut file: FileAssembly) -> EndedFile {
        let tail = std::mem::take(&mut file.buffer);
        EndedFile {
            sequences: file.sequences,
            tail,
            flags: file.flags,
        }
    }

    /// Submit one block's raw bytes directly, bypassing the assembly buffer.
    /// Returns the sequence number it was assigned. Blocks (backpressure) once
    /// `backlog_limit` jobs are in flight across every file.
    #[instrument(skip_all)]
    pub fn submit_block(&self, data: Vec<u8>, flags: BlockFlags) -> Result<u64, BackhandError> {
        let sequence = {
            let mut state = self.shared.state.lock().unwrap();
            if state.poisoned {
                return Err(BackhandError::Sequence(
                    "pipeline already poisoned by a prior error",
                ));
            }
            while state.backlog >= self.backlog_limit {
                state = self.shared.backlog_cond.wait(state).unwrap();
            }
            let sequence = state.next_enqueue;
            state.next_enqueue += 1;
            state.backlog += 1;
            sequence
        };

        let job = Job {
            sequence,
            data,
            flags,
        };
        let shared = Arc::clone(&self.shared);
        let mut codec = self.codec_template.clone_box();

        self.pool.spawn(move || {
            let result = compress_job(&job, codec.as_mut());
            let mut state = shared.state.lock().unwrap();
            if result.is_err() {
                state.poisoned = true;
            }
            state.heap.push(Ready {
                sequence: job.sequence,
                result,
            });
            state.backlog -= 1;
            shared.backlog_cond.notify_all();
            shared.done_cond.notify_all();
        });

        Ok(sequence)
    }

    /// Block until the next block (in submission order) is ready, or `None` once
    /// every submitted job has been drained and none remain in flight.
    #[instrument(skip_all)]
    pub fn next_completed(&self) -> Option<Result<(u64, CompletedBlock), BackhandError>> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.next_dequeue >= state.next_enqueue && state.backlog == 0 {
                return None;
            }
            match state.heap.peek() {
                Some(top) if top.sequence == state.next_dequeue => {
                    return Some(Self::pop_ready(&mut state));
                }
                _ => {
                    state = self.shared.done_cond.wait(state).unwrap();
                }
            }
        }
    }

    /// Like [`Pipeline::next_completed`], but never blocks: returns `None` if the
    /// next-in-order block isn't ready yet, even if more jobs are still in flight.
    /// Used to opportunistically drain completions between submissions.
    pub fn try_next_completed(&self) -> Option<Result<(u64, CompletedBlock), BackhandError>> {
        let mut state = self.shared.state.lock().unwrap();
        match state.heap.peek() {
            Some(top) if top.sequence == state.next_dequeue => Some(Self::pop_ready(&mut state)),
            _ => None,
        }
    }

    fn pop_ready(state: &mut State) -> Result<(u64, CompletedBlock), BackhandError> {
        let ready = state.heap.pop().unwrap();
        state.next_dequeue += 1;
        match ready.result {
            Ok(block) => Ok((ready.sequence, block)),
            Err(msg) => {
                warn!(sequence = ready.sequence, "block compression failed: {msg}");
                Err(BackhandError::PoolPoisoned(Box::new(BackhandError::Sequence(
                    "block compression failed",
                ))))
            }
        }
    }

    /// Block until every block submitted so far (across every file) has been
    /// compressed and handed back in order; unlike [`Pipeline::finish`] the pipeline
    /// remains usable afterwards. The caller is responsible for actually routing each
    /// completion (writing it out) via [`Pipeline::next_completed`]; this is a thin
    /// wrapper for callers with nothing left to route.
    pub fn sync(&self) -> Result<(), BackhandError> {
        while let Some(result) = self.next_completed() {
            result?;
        }
        Ok(())
    }

    /// Drain every in-flight and queued job, returning an error if any failed.
    pub fn finish(&self) -> Result<(), BackhandError> {
        self.sync()
    }
}

fn compress_job(job: &Job, codec: &mut dyn Codec) -> Result<CompletedBlock, String> {
    let align = job.flags.contains(BlockFlags::ALIGN);
    if job.flags.contains(BlockFlags::DONT_COMPRESS) {
        return Ok(CompletedBlock {
            fingerprint: fingerprint(&job.data),
            bytes: job.data.clone(),
            compressed: false,
            align,
        });
    }
    let compressed = codec.compress(&job.data).map_err(|e| e.to_string())?;
    match compressed {
        Some(bytes) if bytes.len() < job.data.len() => Ok(CompletedBlock {
            fingerprint: fingerprint(&job.data),
            bytes,
            compressed: true,
            align,
        }),
        _ => Ok(CompletedBlock {
            fingerprint: fingerprint(&job.data),
            bytes: job.data.clone(),
            compressed: false,
            align,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::default_codec;

    #[test]
    fn preserves_submission_order() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let pipeline = Pipeline::new(codec, 4).unwrap();
        for i in 0..32u8 {
            pipeline
                .submit_block(vec![i; 256], BlockFlags::empty())
                .unwrap();
        }
        let mut seen = Vec::new();
        while let Some(result) = pipeline.next_completed() {
            let (seq, _) = result.unwrap();
            seen.push(seq);
        }
        let expected: Vec<u64> = (0..32).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn streams_a_file_across_several_blocks() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let pipeline = Pipeline::new(codec, 2).unwrap();
        let mut file = pipeline.begin_file(BlockFlags::empty());
        pipeline.append(&mut file, &[7u8; 300], 128).unwrap();
        pipeline.append(&mut file, &[7u8; 100], 128).unwrap();
        let ended = pipeline.end_file(file);

        // 400 bytes in, 128-byte blocks: 3 full blocks, 16 bytes left over.
        assert_eq!(ended.sequences.len(), 3);
        assert!(ended.sequences.iter().all(Option::is_some));
        assert_eq!(ended.tail.len(), 16);
        pipeline.finish().unwrap();
    }

    #[test]
    fn all_zero_block_is_recognized_as_sparse() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let pipeline = Pipeline::new(codec, 1).unwrap();
        let mut file = pipeline.begin_file(BlockFlags::empty());
        pipeline.append(&mut file, &[0u8; 128], 128).unwrap();
        let ended = pipeline.end_file(file);
        assert_eq!(ended.sequences, vec![None]);
        pipeline.finish().unwrap();
    }

    #[test]
    fn ignore_sparse_flag_submits_zero_blocks_for_real() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let pipeline = Pipeline::new(codec, 1).unwrap();
        let mut file = pipeline.begin_file(BlockFlags::IGNORE_SPARSE);
        pipeline.append(&mut file, &[0u8; 128], 128).unwrap();
        let ended = pipeline.end_file(file);
        assert_eq!(ended.sequences.len(), 1);
        assert!(ended.sequences[0].is_some());
        pipeline.finish().unwrap();
    }

    #[test]
    fn cross_file_submission_keeps_backlog_shared() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let pipeline = Pipeline::new(codec, 2).unwrap();
        let mut a = pipeline.begin_file(BlockFlags::empty());
        pipeline.append(&mut a, &[1u8; 256], 128).unwrap();
        let ended_a = pipeline.end_file(a);

        let mut b = pipeline.begin_file(BlockFlags::empty());
        pipeline.append(&mut b, &[2u8; 256], 128).unwrap();
        let ended_b = pipeline.end_file(b);

        // file b's sequence numbers come strictly after file a's: no interleaving of
        // submission order even though both files share the same backlog.
        let max_a = ended_a.sequences.iter().flatten().max().copied().unwrap();
        let min_b = ended_b.sequences.iter().flatten().min().copied().unwrap();
        assert!(max_a < min_b);
        pipeline.finish().unwrap();
    }
}
