/// Characters after which an oversized paragraph may be cut.
const SENTENCE_ENDS: [char; 6] = ['.', '!', '?', '\n', '。', '！'];

/// Splits extracted text into chunks of at most `chunk_size` chars.
///
/// Paragraphs (blank-line separated) are packed greedily. A paragraph longer
/// than `chunk_size` is cut at the last sentence end in the second half of the
/// window, or hard-cut when there is none. Empty and whitespace-only input
/// yields no chunks.
pub fn split_into_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();

        if current_len > 0 && current_len + 2 + para_len > chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if para_len > chunk_size {
            chunks.extend(split_paragraph(para, chunk_size));
            continue;
        }

        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_paragraph(para: &str, chunk_size: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut rest = para;

    loop {
        let rest_len = rest.chars().count();
        if rest_len <= chunk_size {
            if !rest.is_empty() {
                pieces.push(rest.to_string());
            }
            return pieces;
        }

        // Byte offsets of the first `chunk_size` chars.
        let window: Vec<(usize, char)> = rest.char_indices().take(chunk_size).collect();
        let cut = window[chunk_size / 2..]
            .iter()
            .rev()
            .find(|(_, c)| SENTENCE_ENDS.contains(c))
            .map(|(idx, c)| idx + c.len_utf8())
            .unwrap_or_else(|| rest.char_indices().nth(chunk_size).map_or(rest.len(), |(i, _)| i));

        let (head, tail) = rest.split_at(cut);
        let head = head.trim();
        if !head.is_empty() {
            pieces.push(head.to_string());
        }
        rest = tail.trim_start();
    }
}
