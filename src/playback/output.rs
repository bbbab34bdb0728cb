use crate::{PcmBuf, SAMPLE_RATE};
use anyhow::Result;
use parking_lot::Mutex;
use tokio::time::Instant;

/// A sink that plays PCM at absolute positions on its own clock. Positions and
/// durations are in samples at `sample_rate`.
pub trait AudioOutput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current clock position.
    fn now(&self) -> u64;

    fn schedule(&self, start: u64, samples: PcmBuf) -> Result<()>;

    /// Drop everything that has not finished playing.
    fn cancel_all(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub start: u64,
    pub samples: PcmBuf,
}

impl ScheduledBuffer {
    pub fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Output whose clock follows tokio time. Scheduled buffers are recorded, and
/// the resulting timeline can be rendered or written to a WAV file.
pub struct VirtualOutput {
    sample_rate: u32,
    started: Instant,
    buffers: Mutex<Vec<ScheduledBuffer>>,
}

impl Default for VirtualOutput {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

impl VirtualOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            started: Instant::now(),
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn buffers(&self) -> Vec<ScheduledBuffer> {
        self.buffers.lock().clone()
    }

    /// Mix the timeline into one buffer, gaps filled with silence.
    pub fn render(&self) -> PcmBuf {
        let buffers = self.buffers.lock();
        let len = buffers.iter().map(|b| b.end()).max().unwrap_or(0) as usize;
        let mut out = vec![0i16; len];
        for buffer in buffers.iter() {
            let start = buffer.start as usize;
            for (slot, sample) in out[start..start + buffer.samples.len()]
                .iter_mut()
                .zip(&buffer.samples)
            {
                *slot = slot.saturating_add(*sample);
            }
        }
        out
    }

    pub fn write_wav(&self, path: &str) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for sample in self.render() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

impl AudioOutput for VirtualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> u64 {
        let elapsed = self.started.elapsed();
        (elapsed.as_micros() as u64 * self.sample_rate as u64) / 1_000_000
    }

    fn schedule(&self, start: u64, samples: PcmBuf) -> Result<()> {
        self.buffers.lock().push(ScheduledBuffer { start, samples });
        Ok(())
    }

    fn cancel_all(&self) {
        let now = self.now();
        let mut buffers = self.buffers.lock();
        buffers.retain(|b| b.start < now);
        for buffer in buffers.iter_mut() {
            if buffer.end() > now {
                buffer.samples.truncate((now - buffer.start) as usize);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let output = VirtualOutput::new(16000);
        assert_eq!(output.now(), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(output.now(), 4000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_truncates_playing_and_drops_pending() {
        let output = VirtualOutput::new(16000);
        output.schedule(0, vec![1; 1600]).unwrap();
        output.schedule(1600, vec![2; 1600]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        output.cancel_all();
        let buffers = output.buffers();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].samples.len(), 800);
    }

    #[tokio::test]
    async fn test_render_fills_gaps_and_writes_wav() {
        let output = VirtualOutput::new(16000);
        output.schedule(2, vec![5, 5]).unwrap();
        output.schedule(5, vec![7]).unwrap();
        assert_eq!(output.render(), vec![0, 0, 5, 5, 0, 7]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        output.write_wav(path.to_str().unwrap()).unwrap();
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 6);
    }
}
