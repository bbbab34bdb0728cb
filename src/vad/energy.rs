use super::{SpeechProbability, VadContext};
use anyhow::Result;

/// Fallback scorer: frame RMS relative to a reference level.
pub struct EnergyScorer {
    reference_rms: f32,
}

impl EnergyScorer {
    pub fn new(reference_rms: f32) -> Self {
        Self {
            reference_rms: reference_rms.max(1.0),
        }
    }
}

pub fn rms(pcm: &[i16]) -> f32 {
    if pcm.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm.iter().map(|s| (*s as f64) * (*s as f64)).sum();
    (sum / pcm.len() as f64).sqrt() as f32
}

impl SpeechProbability for EnergyScorer {
    fn probabilities(&self, pcm: &[i16], _ctx: &mut VadContext) -> Result<Vec<f32>> {
        Ok(vec![(rms(pcm) / self.reference_rms).clamp(0.0, 1.0)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_scaling() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[100, -100, 100, -100]), 100.0);

        let scorer = EnergyScorer::new(1000.0);
        let mut ctx = VadContext::default();
        assert_eq!(scorer.probabilities(&[500; 16], &mut ctx).unwrap(), vec![0.5]);
        assert_eq!(scorer.probabilities(&[i16::MAX; 16], &mut ctx).unwrap(), vec![1.0]);
    }
}
