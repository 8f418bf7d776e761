use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Modality, RawDetection};
use crate::tiling::TileImage;

/// Recognition results for one document, keyed by backend, tile placement and
/// tile content.
///
/// Callers create one per document and drop it with the document; nothing is
/// shared across requests.
#[derive(Debug, Default)]
pub struct RecognitionCache {
    entries: Mutex<HashMap<String, Vec<RawDetection>>>,
    hits: AtomicUsize,
}

impl RecognitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detections are tile-local, so identical pixels at two grid positions
    /// must not share an entry.
    pub(crate) fn key(modality: Modality, recognizer: &str, tile: &TileImage) -> String {
        let spec = &tile.spec;
        format!(
            "{}:{}:{}-{}@{},{},{}x{}:{}",
            modality.as_str(),
            recognizer,
            spec.index.row,
            spec.index.col,
            spec.x,
            spec.y,
            spec.width,
            spec.height,
            tile.digest()
        )
    }

    pub(crate) fn get(&self, key: &str) -> Option<Vec<RawDetection>> {
        let entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        let found = entries.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub(crate) fn insert(&self, key: String, detections: Vec<RawDetection>) {
        let mut entries = self.entries.lock().unwrap_or_else(|err| err.into_inner());
        entries.insert(key, detections);
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}
