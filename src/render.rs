//! Markdown → Telegram HTML renderer
//!
//! Agent output is free-form markdown with fenced code blocks. Telegram
//! accepts a small HTML subset and rejects any message whose markup does
//! not parse, so the renderer:
//!
//! - splits the input into text lines and fenced code blocks,
//! - escapes literal `& < >` *before* inserting any wrapper tags,
//! - packs rendered text into chunks under a byte budget,
//! - emits code blocks as their own `<pre><code>` chunks,
//! - cuts oversized blocks with a budget-fitting search so that no chunk
//!   exceeds the budget and every chunk closes what it opens.
//!
//! Concatenating the `raw` field of every chunk, in order, reproduces the
//! input byte for byte.

use regex::Regex;
use std::sync::OnceLock;

/// Default per-message budget (Telegram's hard limit is 4096)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4000;

const FENCE: &str = "```";

/// One transport message worth of rendered output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedChunk {
    /// Source slice this chunk was rendered from
    pub raw: String,
    /// Telegram HTML, at most the renderer budget in bytes
    pub html: String,
}

impl RenderedChunk {
    /// Whitespace-only chunks cannot be sent (Telegram rejects empty text)
    pub fn is_blank(&self) -> bool {
        self.html.trim().is_empty()
    }
}

#[derive(Debug)]
enum Block<'a> {
    /// A single text line including its trailing newline
    Line(&'a str),
    Code {
        lang: Option<&'a str>,
        open: &'a str,
        body: &'a str,
        close: &'a str,
    },
}

/// Budgeted markdown renderer
#[derive(Debug, Clone)]
pub struct Renderer {
    max_bytes: usize,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}

impl Renderer {
    /// Create a renderer with the given per-chunk byte budget
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Per-chunk byte budget
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Render markdown into an ordered list of chunks
    pub fn render(&self, markdown: &str) -> Vec<RenderedChunk> {
        let mut chunks = Vec::new();
        let mut pending_raw = String::new();
        let mut pending_html = String::new();

        for block in parse_blocks(markdown) {
            match block {
                Block::Line(line) => {
                    let html = render_inline(line);
                    if pending_html.len() + html.len() <= self.max_bytes {
                        pending_raw.push_str(line);
                        pending_html.push_str(&html);
                        continue;
                    }

                    flush(&mut chunks, &mut pending_raw, &mut pending_html);
                    if html.len() <= self.max_bytes {
                        pending_raw.push_str(line);
                        pending_html.push_str(&html);
                        continue;
                    }

                    for piece in split_to_fit(line, |p| render_inline(p).len() <= self.max_bytes)
                    {
                        chunks.push(RenderedChunk {
                            raw: piece.to_string(),
                            html: render_inline(piece),
                        });
                    }
                }
                Block::Code {
                    lang,
                    open,
                    body,
                    close,
                } => {
                    flush(&mut chunks, &mut pending_raw, &mut pending_html);

                    let pieces = split_to_fit(body, |p| wrap_code(lang, p).len() <= self.max_bytes);
                    let last = pieces.len().saturating_sub(1);
                    if pieces.is_empty() {
                        chunks.push(RenderedChunk {
                            raw: format!("{open}{close}"),
                            html: wrap_code(lang, ""),
                        });
                        continue;
                    }
                    for (i, piece) in pieces.into_iter().enumerate() {
                        let mut raw = String::new();
                        if i == 0 {
                            raw.push_str(open);
                        }
                        raw.push_str(piece);
                        if i == last {
                            raw.push_str(close);
                        }
                        chunks.push(RenderedChunk {
                            raw,
                            html: wrap_code(lang, piece),
                        });
                    }
                }
            }
        }

        flush(&mut chunks, &mut pending_raw, &mut pending_html);
        chunks
    }
}

/// Render with the default budget
pub fn render(markdown: &str) -> Vec<RenderedChunk> {
    Renderer::default().render(markdown)
}

fn flush(chunks: &mut Vec<RenderedChunk>, raw: &mut String, html: &mut String) {
    if raw.is_empty() {
        return;
    }
    chunks.push(RenderedChunk {
        raw: std::mem::take(raw),
        html: std::mem::take(html),
    });
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with(FENCE)
}

fn parse_blocks(input: &str) -> Vec<Block<'_>> {
    let mut blocks = Vec::new();
    let mut open: Option<(usize, &str, Option<&str>)> = None;
    let mut offset = 0;

    for line in input.split_inclusive('\n') {
        let start = offset;
        offset += line.len();

        match open {
            None if is_fence(line) => {
                let tag = line.trim().trim_start_matches('`').trim();
                let lang = tag.split_whitespace().next();
                open = Some((start, line, lang));
            }
            None => blocks.push(Block::Line(line)),
            Some((fence_start, fence, lang)) if is_fence(line) => {
                blocks.push(Block::Code {
                    lang,
                    open: fence,
                    body: &input[fence_start + fence.len()..start],
                    close: line,
                });
                open = None;
            }
            Some(_) => {}
        }
    }

    // Unterminated fence runs to end of input
    if let Some((fence_start, fence, lang)) = open {
        blocks.push(Block::Code {
            lang,
            open: fence,
            body: &input[fence_start + fence.len()..],
            close: "",
        });
    }

    blocks
}

/// Escape the characters Telegram HTML treats as markup
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn inline_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"`([^`\n]+)`|\*\*([^*\n]+)\*\*|\[([^\]\n]+)\]\((https?://[^)\s]+)\)")
            .expect("inline markdown pattern is valid")
    })
}

fn lang_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_+#.-]{1,32}$").expect("language tag pattern is valid")
    })
}

/// Translate inline code, bold and links. The input is escaped first; the
/// pattern only matches characters escaping leaves untouched, so wrappers
/// are inserted into already-escaped text and never escaped again.
fn render_inline(text: &str) -> String {
    let escaped = escape_html(text);
    inline_pattern()
        .replace_all(&escaped, |caps: &regex::Captures<'_>| {
            if let Some(code) = caps.get(1) {
                format!("<code>{}</code>", code.as_str())
            } else if let Some(bold) = caps.get(2) {
                format!("<b>{}</b>", bold.as_str())
            } else {
                let label = caps.get(3).map_or("", |m| m.as_str());
                let href = caps.get(4).map_or("", |m| m.as_str()).replace('"', "&quot;");
                format!("<a href=\"{href}\">{label}</a>")
            }
        })
        .into_owned()
}

fn wrap_code(lang: Option<&str>, body: &str) -> String {
    let shown = body.strip_suffix('\n').unwrap_or(body);
    match lang.filter(|l| lang_pattern().is_match(l)) {
        Some(lang) => format!(
            "<pre><code class=\"language-{lang}\">{}</code></pre>",
            escape_html(shown)
        ),
        None => format!("<pre><code>{}</code></pre>", escape_html(shown)),
    }
}

/// Cut `content` into pieces whose rendered form satisfies `fits`.
///
/// Each piece is the longest prefix that fits, shortened to end just after
/// its last newline when that still fits. The rendered size must be
/// non-decreasing in prefix length (true for both wrappers above). A piece
/// always holds at least one character so the loop makes progress.
fn split_to_fit<F>(content: &str, fits: F) -> Vec<&str>
where
    F: Fn(&str) -> bool,
{
    let mut pieces = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        if fits(rest) {
            pieces.push(rest);
            break;
        }

        let ends: Vec<usize> = rest
            .char_indices()
            .skip(1)
            .map(|(i, _)| i)
            .chain(std::iter::once(rest.len()))
            .collect();
        let fitting = ends.partition_point(|&end| fits(&rest[..end]));
        let mut end = ends[fitting.saturating_sub(1)];

        if let Some(nl) = rest[..end].rfind('\n') {
            if nl > 0 && nl + 1 < end && fits(&rest[..nl + 1]) {
                end = nl + 1;
            }
        }

        pieces.push(&rest[..end]);
        rest = &rest[end..];
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(chunks: &[RenderedChunk]) -> String {
        chunks.iter().map(|c| c.raw.as_str()).collect()
    }

    fn assert_within(chunks: &[RenderedChunk], budget: usize) {
        for chunk in chunks {
            assert!(
                chunk.html.len() <= budget,
                "chunk of {} bytes exceeds {}",
                chunk.html.len(),
                budget
            );
        }
    }

    #[test]
    fn test_long_line_without_newlines() {
        let input = "a".repeat(9000);
        let chunks = Renderer::new(4000).render(&input);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].html.len(), 4000);
        assert_eq!(chunks[1].html.len(), 4000);
        assert_eq!(chunks[2].html.len(), 1000);
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_short_lines_share_a_chunk() {
        let chunks = render("first line\nsecond line\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].html, "first line\nsecond line\n");
    }

    #[test]
    fn test_escape_before_wrap() {
        let chunks = render("a < b & **bold** `x<y` > c");
        assert_eq!(
            chunks[0].html,
            "a &lt; b &amp; <b>bold</b> <code>x&lt;y</code> &gt; c"
        );
    }

    #[test]
    fn test_link_rendering() {
        let chunks = render("see [docs](https://example.com/?a=1&b=2)");
        assert_eq!(
            chunks[0].html,
            "see <a href=\"https://example.com/?a=1&amp;b=2\">docs</a>"
        );
    }

    #[test]
    fn test_non_http_link_stays_literal() {
        let chunks = render("[x](javascript:alert)");
        assert_eq!(chunks[0].html, "[x](javascript:alert)");
    }

    #[test]
    fn test_unclosed_bold_stays_literal() {
        let chunks = render("**not bold");
        assert_eq!(chunks[0].html, "**not bold");
    }

    #[test]
    fn test_code_block_with_language() {
        let input = "before\n```rust\nfn main() { a < b }\n```\nafter\n";
        let chunks = render(input);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].html, "before\n");
        assert_eq!(
            chunks[1].html,
            "<pre><code class=\"language-rust\">fn main() { a &lt; b }</code></pre>"
        );
        assert_eq!(chunks[2].html, "after\n");
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_code_block_rejects_odd_language_tag() {
        let chunks = render("```rust\"><script>\nx\n```");
        assert_eq!(chunks[0].html, "<pre><code>x</code></pre>");
    }

    #[test]
    fn test_code_block_without_language() {
        let chunks = render("```\nplain\n```\n");
        assert_eq!(chunks[0].html, "<pre><code>plain</code></pre>");
    }

    #[test]
    fn test_unterminated_fence() {
        let input = "intro\n```python\nprint(1)\n";
        let chunks = render(input);
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[1].html,
            "<pre><code class=\"language-python\">print(1)</code></pre>"
        );
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_oversized_code_block_splits_at_newlines() {
        let body: String = (0..200).map(|i| format!("let x{i} = {i};\n")).collect();
        let input = format!("```rust\n{body}```\n");
        let chunks = Renderer::new(512).render(&input);

        assert!(chunks.len() > 1);
        assert_within(&chunks, 512);
        for chunk in &chunks {
            assert!(chunk.html.starts_with("<pre><code class=\"language-rust\">"));
            assert!(chunk.html.ends_with("</code></pre>"));
            assert_eq!(chunk.html.matches("<pre>").count(), 1);
            assert_eq!(chunk.html.matches("</pre>").count(), 1);
            // Each piece ends on a line boundary
            assert!(chunk.raw.ends_with('\n'));
        }
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_oversized_code_without_newlines_cuts_exactly() {
        let input = format!("```\n{}\n```", "<".repeat(1000));
        let chunks = Renderer::new(200).render(&input);
        assert_within(&chunks, 200);
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_multibyte_content_is_lossless() {
        let input = format!("{}\n```\n{}\n```\n{}", "é🙂".repeat(300), "ü".repeat(400), "ß".repeat(50));
        let chunks = Renderer::new(128).render(&input);
        assert_within(&chunks, 128);
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_mixed_document_stays_within_budget() {
        let mut input = String::new();
        for i in 0..40 {
            input.push_str(&format!("Paragraph {i} with **bold** and `code` & <tags>\n"));
            if i % 7 == 0 {
                input.push_str("```sh\necho \"hello\" > /tmp/out\n```\n");
            }
        }
        for budget in [96, 256, 4000] {
            let chunks = Renderer::new(budget).render(&input);
            assert_within(&chunks, budget);
            assert_eq!(joined(&chunks), input);
        }
    }

    #[test]
    fn test_split_never_leaves_open_inline_tags() {
        let input = format!("**{}**", "b".repeat(300));
        let chunks = Renderer::new(100).render(&input);
        assert_within(&chunks, 100);
        for chunk in &chunks {
            assert_eq!(chunk.html.matches("<b>").count(), chunk.html.matches("</b>").count());
        }
        assert_eq!(joined(&chunks), input);
    }

    #[test]
    fn test_blank_chunk_detection() {
        let chunks = render("```\na\n```\n\n```\nb\n```\n");
        assert!(chunks.iter().any(RenderedChunk::is_blank));
        assert_eq!(chunks.iter().filter(|c| !c.is_blank()).count(), 2);
    }

    #[test]
    fn test_empty_input() {
        assert!(render("").is_empty());
    }
}
