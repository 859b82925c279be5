//! The `any` detector: every hit is a match.

use serde_json::Value;

use super::Detector;

#[derive(Debug, Default)]
pub struct AnyDetector {
    matches: Vec<Value>,
}

impl AnyDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Detector for AnyDetector {
    fn add_data(&mut self, hits: Vec<Value>) {
        self.matches.extend(hits);
    }

    fn matches_mut(&mut self) -> &mut Vec<Value> {
        &mut self.matches
    }
}
