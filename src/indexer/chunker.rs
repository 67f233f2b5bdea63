//! Overlapping character windows over extracted text.
//!
//! Windows are measured in `char`s. A window prefers to end just after a
//! sentence boundary found in its second half, then on whitespace, and only
//! cuts mid-word when neither exists. Consecutive windows share roughly
//! `overlap` characters.

/// Characters that end a sentence.
const SENTENCE_ENDS: &[char] = &['.', '!', '?', '\n', '。', '！', '？'];

/// Splits `content` into chunks of at most `chunk_size` characters.
///
/// Whitespace-only input yields no chunks. `overlap` is clamped below
/// `chunk_size`, and every window advances by at least one character, so the
/// loop always terminates.
pub fn split_into_chunks(content: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= chunk_size {
        return vec![trimmed.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let cut = if end == chars.len() {
            end
        } else {
            find_cut(&chars, start, end, chunk_size)
        };

        let chunk: String = chars[start..cut].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if cut >= chars.len() {
            break;
        }

        let next = cut.saturating_sub(overlap).max(start + 1);
        // Start the next window on a word rather than mid-token
        start = (next..cut)
            .find(|&p| chars[p - 1].is_whitespace())
            .unwrap_or(next);
    }

    chunks
}

/// Position just after the best boundary in `chars[start..end]`.
fn find_cut(chars: &[char], start: usize, end: usize, chunk_size: usize) -> usize {
    // Search backwards from the window end to its midpoint
    let min_cut = start + (chunk_size / 2).max(1);

    if let Some(i) = (min_cut..end).rev().find(|&i| SENTENCE_ENDS.contains(&chars[i - 1])) {
        return i;
    }
    if let Some(i) = (min_cut..end).rev().find(|&i| chars[i - 1].is_whitespace()) {
        return i;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = split_into_chunks("  Hello world  ", 100, 10);
        assert_eq!(chunks, vec!["Hello world".to_string()]);
    }

    #[test]
    fn test_whitespace_only() {
        assert!(split_into_chunks(" \n\t ", 100, 10).is_empty());
        assert!(split_into_chunks("", 100, 10).is_empty());
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(60);
        let chunks = split_into_chunks(&text, 200, 40);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 200);
        }
    }

    #[test]
    fn test_prefers_sentence_boundary() {
        let text = format!("{}. {}", "a".repeat(70), "b".repeat(70));
        let chunks = split_into_chunks(&text, 100, 0);
        assert_eq!(chunks[0], format!("{}.", "a".repeat(70)));
        assert_eq!(chunks[1], "b".repeat(70));
    }

    #[test]
    fn test_consecutive_chunks_overlap() {
        let words: Vec<String> = (0..200).map(|i| format!("w{i}")).collect();
        let text = words.join(" ");
        let chunks = split_into_chunks(&text, 120, 30);
        assert!(chunks.len() > 2);

        for pair in chunks.windows(2) {
            let last_word = pair[0].split_whitespace().last().unwrap();
            assert!(
                pair[1].split_whitespace().any(|w| w == last_word),
                "expected {last_word} to reappear in the next chunk"
            );
        }
    }

    #[test]
    fn test_no_boundaries_still_progresses() {
        let text = "x".repeat(1050);
        let chunks = split_into_chunks(&text, 100, 20);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        let covered: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(covered >= 1050);
    }

    #[test]
    fn test_overlap_larger_than_chunk_is_clamped() {
        let text = "word ".repeat(100);
        let chunks = split_into_chunks(&text, 10, 50);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn test_multibyte_text() {
        let text = "日本語の文章です。".repeat(50);
        let chunks = split_into_chunks(&text, 40, 8);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 40);
            assert!(chunk.ends_with('。'));
        }
    }
}
