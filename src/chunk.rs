//! Deterministic document chunker.
//!
//! Two modes: **full-content** keeps the whole document as a single chunk
//! (maximum context for small or highly structured documents), and
//! **fixed-size** splits on a target character length, preferring paragraph
//! boundaries (`\n\n`), then sentence boundaries, before a hard cut snapped
//! to a UTF-8 char boundary.
//!
//! Guarantees: never an empty chunk, no trailing content dropped, contiguous
//! indices `0..N-1`, and identical boundaries for identical input + config.
//! Chunks inherit the most recent Markdown heading as their section label.

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Split extracted document text into ordered chunks.
pub fn chunk_document(document_id: &str, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if config.mode == "full_content" || trimmed.len() <= config.full_content_max_chars {
        return vec![make_chunk(document_id, 0, trimmed, first_heading(trimmed))];
    }

    fixed_size_chunks(document_id, trimmed, config.target_chars)
}

fn fixed_size_chunks(document_id: &str, text: &str, target_chars: usize) -> Vec<Chunk> {
    let target = target_chars.max(1);
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buf = String::new();
    let mut buf_section: Option<String> = None;
    let mut current_section: Option<String> = None;
    let mut index: i64 = 0;

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if let Some(heading) = heading_of(para) {
            current_section = Some(heading);
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if would_be > target && !buf.is_empty() {
            chunks_push(&mut chunks, document_id, &mut index, buf.trim(), buf_section);
            buf.clear();
            buf_section = None;
        }

        if para.len() > target {
            // Oversized paragraph: sentence boundaries first, hard cut last.
            if !buf.trim().is_empty() {
                chunks_push(&mut chunks, document_id, &mut index, buf.trim(), buf_section);
            }
            buf.clear();
            buf_section = None;
            for piece in split_oversized(para, target) {
                chunks_push(
                    &mut chunks,
                    document_id,
                    &mut index,
                    piece,
                    current_section.clone(),
                );
            }
        } else {
            if buf.is_empty() {
                buf_section = current_section.clone();
            } else {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
        }
    }

    if !buf.trim().is_empty() {
        chunks_push(
            &mut chunks,
            document_id,
            &mut index,
            buf.trim(),
            buf_section,
        );
    }

    if chunks.is_empty() {
        chunks.push(make_chunk(document_id, 0, text, None));
    }

    chunks
}

fn chunks_push(
    chunks: &mut Vec<Chunk>,
    document_id: &str,
    index: &mut i64,
    text: &str,
    section: Option<String>,
) {
    chunks.push(make_chunk(document_id, *index, text, section));
    *index += 1;
}

/// Split a paragraph longer than `target` into pieces, accumulating whole
/// sentences where possible and hard-cutting sentences longer than `target`.
fn split_oversized(para: &str, target: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < para.len() {
        let remaining = &para[start..];
        if remaining.len() <= target {
            if !remaining.trim().is_empty() {
                pieces.push(remaining.trim());
            }
            break;
        }

        let window = snap_to_char_boundary(remaining, target);
        // Prefer the last sentence end inside the window, then the last
        // whitespace, then a hard cut.
        let cut = last_sentence_end(&remaining[..window])
            .or_else(|| remaining[..window].rfind(char::is_whitespace).map(|p| p + 1))
            .unwrap_or(window);
        let cut = snap_to_char_boundary(remaining, cut.max(1));
        let cut = if cut == 0 {
            next_char_boundary(remaining)
        } else {
            cut
        };

        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        start += cut;
    }

    pieces
}

/// Byte offset just past the last `.`, `?`, or `!` followed by whitespace.
fn last_sentence_end(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut last = None;
    for (i, &b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'?' | b'!') {
            let followed = bytes
                .get(i + 1)
                .map(|&n| n.is_ascii_whitespace())
                .unwrap_or(false);
            if followed {
                last = Some(i + 1);
            }
        }
    }
    last
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

fn heading_of(para: &str) -> Option<String> {
    let first_line = para.lines().next()?;
    let stripped = first_line.trim_start_matches('#');
    if stripped.len() < first_line.len() && !stripped.trim().is_empty() {
        Some(stripped.trim().to_string())
    } else {
        None
    }
}

fn first_heading(text: &str) -> Option<String> {
    text.split("\n\n").find_map(|p| heading_of(p.trim()))
}

fn make_chunk(document_id: &str, index: i64, text: &str, section: Option<String>) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        section_label: section,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(mode: &str, target: usize) -> ChunkingConfig {
        ChunkingConfig {
            mode: mode.to_string(),
            target_chars: target,
            full_content_max_chars: 0,
        }
    }

    #[test]
    fn test_full_content_single_chunk() {
        let text = "Paragraph one.\n\nParagraph two.\n\nParagraph three.";
        let chunks = chunk_document("doc1", text, &cfg("full_content", 10));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert!(chunks[0].text.contains("Paragraph three."));
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunks = chunk_document("doc1", "   \n\n  ", &cfg("fixed_size", 100));
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} about dosage thresholds.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_document("doc1", &text, &cfg("fixed_size", 120));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "gap at position {}", i);
        }
    }

    #[test]
    fn test_no_trailing_content_dropped() {
        let text = "Alpha beta gamma.\n\nDelta epsilon zeta.\n\nFinal trailing sentence.";
        let chunks = chunk_document("doc1", text, &cfg("fixed_size", 20));
        // Whole token sequence survives, in order, across chunk boundaries.
        let joined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let original: Vec<&str> = text.split_whitespace().collect();
        let recombined: Vec<&str> = joined.split_whitespace().collect();
        assert_eq!(recombined, original);
    }

    #[test]
    fn test_no_empty_chunks() {
        let text = "Word. ".repeat(300);
        let chunks = chunk_document("doc1", &text, &cfg("fixed_size", 50));
        for c in &chunks {
            assert!(!c.text.trim().is_empty());
        }
    }

    #[test]
    fn test_oversized_paragraph_prefers_sentence_boundary() {
        let text = "First sentence here. Second sentence here. Third sentence here.";
        let chunks = chunk_document("doc1", text, &cfg("fixed_size", 30));
        assert!(chunks.len() > 1);
        // Every piece except possibly the last ends at a sentence boundary.
        for c in &chunks[..chunks.len() - 1] {
            assert!(
                c.text.ends_with('.'),
                "piece not sentence-aligned: {:?}",
                c.text
            );
        }
    }

    #[test]
    fn test_deterministic_boundaries() {
        let text = "Alpha.\n\nBeta gamma delta.\n\nEpsilon zeta eta theta iota kappa.";
        let a = chunk_document("doc1", text, &cfg("fixed_size", 25));
        let b = chunk_document("doc1", text, &cfg("fixed_size", 25));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.chunk_index, y.chunk_index);
        }
    }

    #[test]
    fn test_section_label_from_heading() {
        let text = "# Dosage\n\nTake 500mg twice daily for adults.\n\n# Contraindications\n\nDo not combine with warfarin therapy in elderly patients.";
        let chunks = chunk_document("doc1", text, &cfg("fixed_size", 60));
        assert!(chunks
            .iter()
            .any(|c| c.section_label.as_deref() == Some("Dosage")));
        assert!(chunks
            .iter()
            .any(|c| c.section_label.as_deref() == Some("Contraindications")));
    }

    #[test]
    fn test_multibyte_utf8_hard_cut() {
        let text = "μεγάλη παράγραφος χωρίς τελείες ".repeat(20);
        let chunks = chunk_document("doc1", &text, &cfg("fixed_size", 40));
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_three_page_document_scenario() {
        // ~3 "pages" of text with fixed chunk size 500 yields 3-6 chunks.
        let page = "Clinical observation: the patient presented with elevated \
                    blood pressure and intermittent chest pain. Treatment was \
                    adjusted according to the current hypertension protocol. \
                    Follow-up is scheduled within two weeks of discharge. \
                    Laboratory findings showed mildly elevated creatinine and \
                    a stable lipid panel without new abnormalities. The \
                    cardiology consult recommended continuing the current \
                    regimen and a repeat echocardiogram at the next visit."
            .to_string();
        assert!(page.len() < 500, "page fixture must fit one chunk");
        let text = vec![page; 3].join("\n\n");
        let chunks = chunk_document("doc1", &text, &cfg("fixed_size", 500));
        assert!(
            (3..=6).contains(&chunks.len()),
            "unexpected chunk count {}",
            chunks.len()
        );
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
    }
}
