//! Splitting outbound text into protocol-sized pieces.

/// Split `text` into lines, then each line into chunks of at most `max_len`
/// bytes. Chunks never end inside a UTF-8 code point. Empty lines are dropped.
///
/// A single character wider than `max_len` is still emitted on its own.
pub fn split_line(text: &str, max_len: usize) -> Vec<String> {
    text.split(['\n', '\r'])
        .filter(|line| !line.is_empty())
        .flat_map(|line| split_bytes(line, max_len))
        .collect()
}

/// Split one line into chunks of at most `max_len` bytes on char boundaries.
pub fn split_bytes(line: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut rest = line;
    while !rest.is_empty() {
        if rest.len() <= max_len {
            chunks.push(rest.to_string());
            break;
        }
        let mut end = max_len;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head.to_string());
        rest = tail;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(split_line("hello", 10), vec!["hello"]);
    }

    #[test]
    fn splits_on_newlines_and_drops_empty_lines() {
        assert_eq!(split_line("a\n\nb\r\nc", 10), vec!["a", "b", "c"]);
    }

    #[test]
    fn chunks_respect_byte_bound_and_concatenate() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = split_line(text, 7);
        assert!(chunks.iter().all(|c| c.len() <= 7));
        assert_eq!(chunks.concat(), text);
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn never_splits_inside_a_code_point() {
        let text = "héllo wörld ✓✓✓ 𝄞𝄞 done";
        for max in 1..12 {
            let chunks = split_bytes(text, max);
            assert_eq!(chunks.concat(), text, "max {max}");
            for chunk in &chunks {
                assert!(
                    chunk.len() <= max || chunk.chars().count() == 1,
                    "chunk {chunk:?} exceeds {max}"
                );
            }
        }
    }

    #[test]
    fn oversized_character_is_emitted_alone() {
        assert_eq!(split_bytes("𝄞a", 2), vec!["𝄞", "a"]);
    }
}
