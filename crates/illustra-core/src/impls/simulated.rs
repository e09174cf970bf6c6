//! SimulatedGenerator - fake image generation for demos.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::ports::{GenerationContext, GenerationError, IllustrationGenerator};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Sleeps for `latency`, then fails transiently with probability `fail_rate`
/// (clamped to `0.0..=1.0`, NaN counts as 0). Empty prompts fail permanently.
#[derive(Debug, Clone)]
pub struct SimulatedGenerator {
    fail_rate: f64,
    latency: Duration,
}

impl SimulatedGenerator {
    pub fn new(fail_rate: f64, latency: Duration) -> Self {
        let fail_rate = if fail_rate.is_nan() {
            0.0
        } else {
            fail_rate.clamp(0.0, 1.0)
        };
        Self { fail_rate, latency }
    }

    pub fn fail_rate(&self) -> f64 {
        self.fail_rate
    }
}

impl Default for SimulatedGenerator {
    fn default() -> Self {
        Self::new(0.0, Duration::from_millis(50))
    }
}

#[async_trait]
impl IllustrationGenerator for SimulatedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<Vec<u8>, GenerationError> {
        if prompt.trim().is_empty() {
            return Err(GenerationError::Permanent("empty prompt".into()));
        }
        let fails = rand::thread_rng().gen_bool(self.fail_rate);
        tokio::time::sleep(self.latency).await;
        if fails {
            return Err(GenerationError::Transient(format!(
                "simulated upstream timeout on page {}",
                context.page_number
            )));
        }

        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(prompt.as_bytes());
        Ok(bytes)
    }
}
