//! Introduction puzzle factory: generates the (solution,
//! rendered bytes) pair for a locally-generated puzzle. Rendering the
//! actual CAPTCHA image is an external collaborator;
//! [`PuzzleRenderer`] is the seam a host would bind a real renderer to.

use std::sync::Arc;

use crate::capability::RandomSource;
use crate::error::WotResult;

/// Length of the generated solution string.
const SOLUTION_LENGTH: usize = 8;

/// Renders a CAPTCHA image for a given solution string. Out of scope;
/// this trait is the seam.
pub trait PuzzleRenderer: Send + Sync {
    /// Returns `(mime_type, bytes)`.
    fn render(&self, solution: &str) -> WotResult<(String, Vec<u8>)>;
}

/// Renderer that stands in for a real CAPTCHA image generator in tests
/// and as a harmless default; emits the solution string itself as the
/// payload rather than drawing anything.
pub struct PlaceholderRenderer;

impl PuzzleRenderer for PlaceholderRenderer {
    fn render(&self, solution: &str) -> WotResult<(String, Vec<u8>)> {
        Ok(("image/png".to_string(), solution.as_bytes().to_vec()))
    }
}

/// Produces one puzzle's (solution, mime type, rendered bytes) triple.
pub struct PuzzleFactory {
    random: Arc<dyn RandomSource>,
    renderer: Arc<dyn PuzzleRenderer>,
}

impl PuzzleFactory {
    pub fn new(random: Arc<dyn RandomSource>, renderer: Arc<dyn PuzzleRenderer>) -> Self {
        Self { random, renderer }
    }

    pub fn generate(&self) -> WotResult<(String, String, Vec<u8>)> {
        let solution = self.random.solution_string(SOLUTION_LENGTH);
        let (mime_type, bytes) = self.renderer.render(&solution)?;
        Ok((solution, mime_type, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CountingRandom;

    #[test]
    fn generates_solution_of_configured_length() {
        let factory = PuzzleFactory::new(Arc::new(CountingRandom::new(7)), Arc::new(PlaceholderRenderer));
        let (solution, mime, bytes) = factory.generate().unwrap();
        assert_eq!(solution.len(), SOLUTION_LENGTH);
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, solution.as_bytes());
    }
}
