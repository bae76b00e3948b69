//! Markup stripping for archive metadata text.
//!
//! Dataset descriptions arrive as a mix of plain text, HTML fragments and
//! Markdown. Search only cares about the words, so this module removes the
//! markup and collapses whitespace. The functions are pure and allocation is
//! proportional to the input.

use regex::{Captures, Regex};
use std::sync::OnceLock;

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("markup pattern must compile"))
}

fn html_comment() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?s)<!--.*?-->")
}

fn script_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?is)<script\b[^>]*>.*?</script\s*>")
}

fn style_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?is)<style\b[^>]*>.*?</style\s*>")
}

fn html_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"</?[A-Za-z][^>]*>")
}

fn markdown_image() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"!\[([^\]]*)\]\([^)]*\)")
}

fn markdown_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\[([^\]]+)\]\([^)]*\)")
}

fn markdown_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?m)^[ \t]{0,3}(#{1,6}|>+)[ \t]*")
}

fn markdown_emphasis() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"\*{1,3}|_{2,3}|~~|`+")
}

fn entity() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z]{2,6});")
}

/// Remove HTML and Markdown markup and collapse whitespace.
///
/// ```
/// use dandi_search_text::strip_markup;
///
/// let text = strip_markup("<p>Recordings from the <b>olfactory&nbsp;bulb</b></p>");
/// assert_eq!(text, "Recordings from the olfactory bulb");
/// ```
pub fn strip_markup(input: &str) -> String {
    let text = html_comment().replace_all(input, " ");
    let text = script_block().replace_all(&text, " ");
    let text = style_block().replace_all(&text, " ");
    let text = html_tag().replace_all(&text, " ");
    let text = markdown_image().replace_all(&text, "$1");
    let text = markdown_link().replace_all(&text, "$1");
    let text = markdown_heading().replace_all(&text, "");
    let text = markdown_emphasis().replace_all(&text, " ");
    let text = decode_entities(&text);
    collapse_whitespace(&text)
}

/// Decode the handful of HTML entities that show up in archive metadata.
/// Unknown named entities are left untouched.
pub fn decode_entities(input: &str) -> String {
    entity()
        .replace_all(input, |caps: &Captures<'_>| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body
                .strip_prefix("#x")
                .or_else(|| body.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match body {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    "ndash" => Some('-'),
                    "mdash" => Some('-'),
                    _ => None,
                }
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Collapse every run of whitespace into a single space and trim both ends.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate `text` to at most `max_chars` characters, preferring to cut at a
/// word boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        None => text,
        Some((cut, _)) => {
            let head = &text[..cut];
            match head.rfind(' ') {
                Some(space) if space > 0 => &head[..space],
                _ => head,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_tags_and_comments() {
        let input = "<div><!-- hidden -->Mouse <em>visual</em> cortex<br/>imaging</div>";
        assert_eq!(strip_markup(input), "Mouse visual cortex imaging");
    }

    #[test]
    fn test_strip_script_and_style() {
        let input = "<style>p { color: red }</style>Rat<script>alert('x')</script> hippocampus";
        assert_eq!(strip_markup(input), "Rat hippocampus");
    }

    #[test]
    fn test_strip_markdown() {
        let input = "# Title\n\nSee the **olfactory bulb** [protocol](https://example.org/p) and ![fig](a.png)\n> quoted `code`";
        assert_eq!(
            strip_markup(input),
            "Title See the olfactory bulb protocol and fig quoted code"
        );
    }

    #[test]
    fn test_single_underscores_survive() {
        assert_eq!(strip_markup("sub_001 __bold__"), "sub_001 bold");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp; b &lt;c&gt;"), "a & b <c>");
        assert_eq!(decode_entities("&#65;&#x42;"), "AB");
        assert_eq!(decode_entities("&unknown;"), "&unknown;");
    }

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a\t\tb \n\n c  "), "a b c");
        assert_eq!(collapse_whitespace("   "), "");
    }

    #[test]
    fn test_truncate_chars_prefers_word_boundary() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("olfactory bulb recordings", 18), "olfactory bulb");
        assert_eq!(truncate_chars("abcdefgh", 4), "abcd");
        // Multi-byte characters are counted as characters, not bytes.
        assert_eq!(truncate_chars("ééééé", 3), "ééé");
    }
}
