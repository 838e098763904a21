//! Progress-callback trait for batch extraction events.
//!
//! Pass an [`Arc<dyn BatchProgressCallback>`] to
//! [`crate::Extractor::with_progress`] to hear about each image as
//! [`crate::Extractor::extract_batch`] works through it. The CLI drives its
//! progress bar this way; a server could forward the same events to a
//! websocket.
//!
//! # Example
//!
//! ```rust
//! use receipt2json::BatchProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl BatchProgressCallback for Counter {
//!     fn on_image_complete(&self, _index: usize, total: usize, image_ref: &str, is_receipt: bool) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}/{total} {image_ref} receipt={is_receipt}");
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the batch runner as it processes each image.
///
/// Images run concurrently, so per-image methods may be called from
/// several tasks at once. `index` is the 0-based position in the input.
/// Every method has a no-op default.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once before any image is started.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    fn on_image_start(&self, index: usize, total: usize, image_ref: &str) {
        let _ = (index, total, image_ref);
    }

    /// The pipeline succeeded. `is_receipt` is false for a "not a receipt" verdict.
    fn on_image_complete(&self, index: usize, total: usize, image_ref: &str, is_receipt: bool) {
        let _ = (index, total, image_ref, is_receipt);
    }

    /// The pipeline returned a failure; `error` is its display form.
    fn on_image_error(&self, index: usize, total: usize, image_ref: &str, error: &str) {
        let _ = (index, total, image_ref, error);
    }

    /// Called once after every image has finished.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// Ignores every event.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn BatchProgressCallback>;
