//! Overlapping token-window chunker.
//!
//! Splits extracted document text into segments of at most `max_tokens`
//! tokens, with consecutive segments sharing `overlap` tokens so retrieval
//! keeps cross-boundary context. Tokens are whitespace-delimited words with
//! their trailing whitespace attached, so concatenating a token range
//! reproduces the original text exactly.
//!
//! Near the end of each window the chunker scans backward through the
//! overlap region for a sentence end (`". "`) or a newline and cuts there
//! instead of the raw token boundary, to avoid splitting mid-sentence.
//! Text the tokenizer cannot split (a single run longer than the window)
//! degrades to fixed-size character slicing with the same overlap.

/// Approximate chars-per-token ratio used by the character-slicing fallback.
const CHARS_PER_TOKEN: usize = 4;

/// Split `text` into overlapping chunks of at most `max_tokens` tokens.
///
/// Empty or whitespace-only input yields an empty Vec. Never panics:
/// degenerate inputs fall back to character slicing.
pub fn chunk_text(text: &str, max_tokens: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() || max_tokens == 0 {
        return Vec::new();
    }
    // Bounded overlap keeps window advance strictly positive.
    let overlap = overlap.min(max_tokens - 1);

    let tokens = tokenize(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    // A single unsplittable run longer than the window: token windows can't
    // divide it, slice by characters instead.
    if tokens.len() == 1 && text.chars().count() > max_tokens * CHARS_PER_TOKEN {
        return chunk_by_chars(text, max_tokens, overlap);
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < tokens.len() {
        let mut end = (start + max_tokens).min(tokens.len());

        // Not the last window: prefer a sentence or paragraph boundary
        // inside the overlap region.
        if end < tokens.len() {
            let scan_from = start.max(end.saturating_sub(overlap));
            if let Some(cut) = (scan_from..end).rev().find(|&i| is_break_token(token_str(text, &tokens, i))) {
                end = cut + 1;
            }
        }

        let piece = text[tokens[start].0..tokens[end - 1].1].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        start = (start + max_tokens - overlap).max(end.saturating_sub(overlap));
    }

    chunks
}

/// Byte ranges of tokens: each a word plus its trailing whitespace.
/// Leading whitespace attaches to the first token.
fn tokenize(text: &str) -> Vec<(usize, usize)> {
    let mut tokens = Vec::new();
    let mut start = 0usize;
    let mut seen_word = false;
    let mut in_trailing_ws = false;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if seen_word {
                in_trailing_ws = true;
            }
        } else if in_trailing_ws {
            tokens.push((start, i));
            start = i;
            in_trailing_ws = false;
        } else {
            seen_word = true;
        }
    }
    if seen_word {
        tokens.push((start, text.len()));
    }
    tokens
}

fn token_str<'a>(text: &'a str, tokens: &[(usize, usize)], i: usize) -> &'a str {
    &text[tokens[i].0..tokens[i].1]
}

/// A token marks a break point if its word ends a sentence (`.` followed by
/// whitespace) or its trailing whitespace contains a newline.
fn is_break_token(token: &str) -> bool {
    let word = token.trim_end();
    if word.len() == token.len() {
        return false;
    }
    word.ends_with('.') || token[word.len()..].contains('\n')
}

/// Fixed-size character slicing with the same overlap, on char boundaries.
fn chunk_by_chars(text: &str, max_tokens: usize, overlap: usize) -> Vec<String> {
    let width = max_tokens * CHARS_PER_TOKEN;
    let step = (max_tokens - overlap) * CHARS_PER_TOKEN;
    let chars: Vec<char> = text.chars().collect();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + width).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        start += step;
    }
    chunks
}
