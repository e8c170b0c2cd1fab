//! Token counting for the input budget
//!
//! Uses the `cl100k_base` encoding; the byte-length estimate is only used
//! when the encoding cannot be loaded.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tiktoken_rs::{cl100k_base, CoreBPE};

const FALLBACK_BYTES_PER_TOKEN: usize = 4;

static CL100K: Lazy<Mutex<Option<CoreBPE>>> = Lazy::new(|| Mutex::new(cl100k_base().ok()));

/// Number of tokens in `text`
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match CL100K.lock().as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => fallback_count(text),
    }
}

fn fallback_count(text: &str) -> usize {
    text.len().div_ceil(FALLBACK_BYTES_PER_TOKEN)
}
