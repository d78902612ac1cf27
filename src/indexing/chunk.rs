//! Fixed-size document chunking with overlap.
//!
//! Splits document content into chunks of at most `chunk_size` bytes,
//! preferring paragraph, line and word boundaries, with `chunk_overlap`
//! bytes carried over between consecutive chunks. Cuts always land on UTF-8
//! character boundaries.

use super::Document;

const BREAK_SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// Splits every document into chunks, each carrying a clone of its source
/// document's metadata.
pub fn generate_chunks(
    documents: &[Document],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Document> {
    let mut chunks = Vec::new();
    for document in documents {
        for text in split_text(&document.content, chunk_size, chunk_overlap) {
            chunks.push(Document {
                content: text,
                metadata: document.metadata.clone(),
            });
        }
    }
    chunks
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index.min(text.len())
}

/// Splits one text into chunks of at most `chunk_size` bytes with
/// `chunk_overlap` bytes of overlap, cutting at the last natural boundary
/// inside the window when there is one.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size / 2);
    let mut chunks = Vec::new();

    let mut start = 0;
    while start < text.len() {
        let window_end = floor_char_boundary(text, start + chunk_size);
        let mut cut = window_end;
        if window_end < text.len() {
            for separator in BREAK_SEPARATORS {
                if let Some(position) = text[start..window_end].rfind(separator) {
                    if position > 0 {
                        cut = start + position;
                        break;
                    }
                }
            }
        }

        let piece = text[start..cut].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if cut >= text.len() {
            break;
        }

        // Step back for the overlap, but always move forward overall.
        let next = floor_char_boundary(text, cut.saturating_sub(chunk_overlap));
        start = if next > start {
            next
        } else {
            ceil_char_boundary(text, cut.max(start) + 1)
        };
    }

    chunks
}
