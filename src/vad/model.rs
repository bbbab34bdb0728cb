use super::{SpeechProbability, VadContext};
use anyhow::Result;

/// A recurrent speech model fed fixed-size chunks of normalized samples.
pub trait SpeechModel: Send + Sync {
    fn chunk_size(&self) -> usize {
        512
    }

    /// Initial hidden state for a fresh context.
    fn initial_state(&self) -> Vec<f32>;

    /// Score one chunk, updating `state` in place.
    fn predict(&self, chunk: &[f32], state: &mut Vec<f32>) -> Result<f32>;
}

/// Drives a `SpeechModel` over arbitrary frame sizes, carrying leftover samples
/// and the hidden state in the session's `VadContext`.
pub struct ModelScorer {
    model: Box<dyn SpeechModel>,
}

impl ModelScorer {
    pub fn new(model: Box<dyn SpeechModel>) -> Self {
        Self { model }
    }
}

impl SpeechProbability for ModelScorer {
    fn probabilities(&self, pcm: &[i16], ctx: &mut VadContext) -> Result<Vec<f32>> {
        if ctx.model_state.is_empty() {
            ctx.model_state = self.model.initial_state();
        }
        ctx.pending
            .extend(pcm.iter().map(|s| *s as f32 / i16::MAX as f32));

        let chunk_size = self.model.chunk_size().max(1);
        let mut probs = Vec::new();
        let mut consumed = 0;
        while ctx.pending.len() - consumed >= chunk_size {
            let chunk = &ctx.pending[consumed..consumed + chunk_size];
            probs.push(self.model.predict(chunk, &mut ctx.model_state)?);
            consumed += chunk_size;
        }
        ctx.pending.drain(..consumed);
        Ok(probs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mean absolute amplitude, plus a counter in the hidden state.
    struct FakeModel;

    impl SpeechModel for FakeModel {
        fn initial_state(&self) -> Vec<f32> {
            vec![0.0]
        }

        fn predict(&self, chunk: &[f32], state: &mut Vec<f32>) -> Result<f32> {
            state[0] += 1.0;
            Ok(chunk.iter().map(|s| s.abs()).sum::<f32>() / chunk.len() as f32)
        }
    }

    #[test]
    fn test_chunks_and_carries_state() {
        let scorer = ModelScorer::new(Box::new(FakeModel));
        let mut ctx = VadContext::default();

        // 960 samples: one full chunk, 448 pending.
        let probs = scorer.probabilities(&[0; 960], &mut ctx).unwrap();
        assert_eq!(probs.len(), 1);
        assert_eq!(ctx.pending.len(), 448);
        assert_eq!(ctx.model_state, vec![1.0]);

        // 448 + 960 = 1408: two chunks, 384 pending.
        let probs = scorer.probabilities(&[i16::MAX; 960], &mut ctx).unwrap();
        assert_eq!(probs.len(), 2);
        assert_eq!(ctx.pending.len(), 384);
        assert_eq!(ctx.model_state, vec![3.0]);
        assert!(probs[1] > 0.99);

        ctx.reset();
        assert!(ctx.pending.is_empty());
        assert!(ctx.model_state.is_empty());
    }
}
