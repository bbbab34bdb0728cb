use crate::{AudioFormat, PcmBuf, SAMPLE_RATE, bytes_to_samples};
use anyhow::{Result, anyhow};

/// Turns one binary client frame into 16 kHz mono PCM.
pub trait AudioDecoder: Send {
    fn format(&self) -> AudioFormat;
    fn decode(&mut self, frame: &[u8]) -> Result<PcmBuf>;
}

/// Little-endian PCM16, passed through.
#[derive(Debug, Default)]
pub struct PcmDecoder;

impl AudioDecoder for PcmDecoder {
    fn format(&self) -> AudioFormat {
        AudioFormat::Pcm
    }

    fn decode(&mut self, frame: &[u8]) -> Result<PcmBuf> {
        if frame.len() % 2 != 0 {
            return Err(anyhow!("pcm frame has odd length {}", frame.len()));
        }
        Ok(bytes_to_samples(frame))
    }
}

#[cfg(feature = "opus")]
pub use opus::OpusDecoder;

#[cfg(feature = "opus")]
mod opus {
    use super::*;
    use audiopus::coder::Decoder;
    use audiopus::{Channels, MutSignals, SampleRate};

    /// 120 ms at 16 kHz, the longest packet Opus produces.
    const MAX_DECODED_SAMPLES: usize = 1920;

    pub struct OpusDecoder {
        decoder: Decoder,
    }

    impl OpusDecoder {
        pub fn new() -> Result<Self> {
            let decoder = Decoder::new(SampleRate::Hz16000, Channels::Mono)
                .map_err(|e| anyhow!("Failed to create Opus decoder: {e}"))?;
            Ok(Self { decoder })
        }
    }

    impl AudioDecoder for OpusDecoder {
        fn format(&self) -> AudioFormat {
            AudioFormat::Opus
        }

        fn decode(&mut self, frame: &[u8]) -> Result<PcmBuf> {
            let mut output = vec![0i16; MAX_DECODED_SAMPLES];
            let packet = audiopus::packet::Packet::try_from(frame)
                .map_err(|e| anyhow!("Invalid Opus packet: {e}"))?;
            let signals = MutSignals::try_from(output.as_mut_slice())
                .map_err(|e| anyhow!("Failed to create output buffer: {e}"))?;
            let decoded = self
                .decoder
                .decode(Some(packet), signals, false)
                .map_err(|e| anyhow!("Opus decode failed: {e}"))?;
            output.truncate(decoded);
            Ok(output)
        }
    }
}

pub fn create_decoder(format: AudioFormat) -> Result<Box<dyn AudioDecoder>> {
    match format {
        AudioFormat::Pcm => Ok(Box::new(PcmDecoder)),
        #[cfg(feature = "opus")]
        AudioFormat::Opus => Ok(Box::new(OpusDecoder::new()?)),
        #[cfg(not(feature = "opus"))]
        AudioFormat::Opus => Err(anyhow!("opus support is not compiled in")),
    }
}

/// Duration of `samples` PCM samples at the gateway rate, in milliseconds.
pub fn samples_duration_ms(samples: usize) -> u64 {
    samples as u64 * 1000 / SAMPLE_RATE as u64
}
