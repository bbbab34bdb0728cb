//! Client-side jitter buffer: received packets are decoded and scheduled on an
//! output clock so playback is gapless and strictly sequential.
use crate::{PcmBuf, codec::AudioDecoder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

mod output;
mod queue;

pub use output::{AudioOutput, ScheduledBuffer, VirtualOutput};
pub use queue::BlockingQueue;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackOption {
    /// Audio accumulated before a buffer is scheduled.
    pub min_play_ms: u64,
    /// How long the play loop waits for more audio before flushing what it has.
    pub flush_timeout_ms: u64,
    pub raw_capacity: usize,
    pub decoded_capacity: usize,
    /// Raw packets taken per decode iteration.
    pub decode_batch: usize,
}

impl Default for PlaybackOption {
    fn default() -> Self {
        Self {
            min_play_ms: 120,
            flush_timeout_ms: 60,
            raw_capacity: 512,
            decoded_capacity: 64,
            decode_batch: 8,
        }
    }
}

/// Queued items carry the generation they were received in; `stop` bumps it so
/// anything already in flight is recognized as stale.
type Tagged<T> = (u64, T);

struct Schedule {
    generation: u64,
    scheduled_end: u64,
}

struct ContextInner {
    option: PlaybackOption,
    raw: BlockingQueue<Tagged<Vec<u8>>>,
    decoded: BlockingQueue<Tagged<PcmBuf>>,
    output: Arc<dyn AudioOutput>,
    schedule: Mutex<Schedule>,
}

#[derive(Clone)]
pub struct StreamingAudioContext {
    inner: Arc<ContextInner>,
}

impl StreamingAudioContext {
    pub fn new(option: PlaybackOption, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                raw: BlockingQueue::new(option.raw_capacity),
                decoded: BlockingQueue::new(option.decoded_capacity),
                option,
                output,
                schedule: Mutex::new(Schedule {
                    generation: 0,
                    scheduled_end: 0,
                }),
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.schedule.lock().generation
    }

    /// Output position where the next buffer will start at the earliest.
    pub fn scheduled_end(&self) -> u64 {
        self.inner.schedule.lock().scheduled_end
    }

    pub fn queued(&self) -> (usize, usize) {
        (self.inner.raw.len(), self.inner.decoded.len())
    }

    /// Queue one received packet. Waits while the raw queue is full.
    pub async fn push_packet(&self, packet: Vec<u8>) -> anyhow::Result<()> {
        let generation = self.generation();
        self.inner
            .raw
            .push((generation, packet))
            .await
            .map_err(|_| anyhow::anyhow!("playback stream already ended"))
    }

    /// No more packets will arrive. The loops finish once everything queued
    /// has been scheduled.
    pub fn end_of_stream(&self) {
        self.inner.raw.close();
    }

    /// Drop queued and scheduled audio and restart the output timeline.
    pub fn stop(&self) {
        let mut schedule = self.inner.schedule.lock();
        schedule.generation += 1;
        let raw = self.inner.raw.clear();
        let decoded = self.inner.decoded.clear();
        self.inner.output.cancel_all();
        schedule.scheduled_end = 0;
        debug!(
            generation = schedule.generation,
            raw, decoded, "playback stopped"
        );
    }

    /// Run the decode and play loops until the stream ends.
    pub async fn run(&self, decoder: Box<dyn AudioDecoder>) {
        tokio::join!(self.decode_loop(decoder), self.play_loop());
    }

    async fn decode_loop(&self, mut decoder: Box<dyn AudioDecoder>) {
        loop {
            let batch = self.inner.raw.pop_batch(self.inner.option.decode_batch).await;
            if batch.is_empty() {
                break;
            }
            for (generation, packet) in batch {
                if generation != self.generation() {
                    continue;
                }
                match decoder.decode(&packet) {
                    Ok(pcm) if pcm.is_empty() => {}
                    Ok(pcm) => {
                        if self.inner.decoded.push((generation, pcm)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("drop undecodable packet of {} bytes: {}", packet.len(), e),
                }
            }
        }
        self.inner.decoded.close();
    }

    async fn play_loop(&self) {
        let rate = self.inner.output.sample_rate() as u64;
        let min_samples = (self.inner.option.min_play_ms * rate / 1000) as usize;
        let flush_timeout = Duration::from_millis(self.inner.option.flush_timeout_ms);
        while let Some((mut generation, mut pcm)) = self.inner.decoded.pop().await {
            while pcm.len() < min_samples {
                match self.inner.decoded.pop_timeout(flush_timeout).await {
                    Some((g, block)) if g == generation => pcm.extend_from_slice(&block),
                    // Stopped while accumulating: start over with the newer audio.
                    Some((g, block)) if g > generation => {
                        generation = g;
                        pcm = block;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            self.schedule_block(generation, pcm);
        }
    }

    fn schedule_block(&self, generation: u64, pcm: PcmBuf) {
        let mut schedule = self.inner.schedule.lock();
        if generation != schedule.generation {
            debug!(generation, "drop stale playback block");
            return;
        }
        let start = self.inner.output.now().max(schedule.scheduled_end);
        let len = pcm.len() as u64;
        if let Err(e) = self.inner.output.schedule(start, pcm) {
            warn!("schedule playback failed: {}", e);
            return;
        }
        schedule.scheduled_end = start + len;
    }
}

#[cfg(test)]
mod tests;
