use std::borrow::Cow;

/// Ellipsis appended when text is cut
const ELLIPSIS: &str = "...";

/// Turn an HTML fragment into a single line of plain text.
///
/// Tags are dropped, the handful of entities that show up in feed snippets
/// are decoded, control characters removed and whitespace collapsed. This is
/// not an HTML parser; malformed markup degrades to slightly noisy text.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_control() => text.push(' '),
            c => text.push(c),
        }
    }

    let decoded = decode_entities(&text);
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}

/// Cut `s` to at most `max_chars` characters, appending "..." when cut.
///
/// Counts chars, not bytes, so multi-byte text is never split mid-character.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    Cow::Owned(out)
}

/// `src` of the first `<img>` tag in an HTML fragment, if any.
pub fn first_inline_image(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(rel) = lower[search_from..].find("<img") {
        let tag_start = search_from + rel;
        let tag_end = lower[tag_start..]
            .find('>')
            .map(|i| tag_start + i)
            .unwrap_or(lower.len());
        let tag = &lower[tag_start..tag_end];

        if let Some(src_rel) = tag.find("src=") {
            let value_start = tag_start + src_rel + "src=".len();
            // Byte offsets are shared: to_ascii_lowercase keeps lengths intact
            let rest = &html[value_start..tag_end];
            let src = match rest.chars().next() {
                Some(quote @ ('"' | '\'')) => rest[1..].split(quote).next(),
                Some(_) => rest.split(|c: char| c.is_whitespace() || c == '/').next(),
                None => None,
            };
            if let Some(src) = src.map(str::trim).filter(|s| !s.is_empty()) {
                return Some(src.to_string());
            }
        }
        search_from = tag_end;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_removes_tags_and_collapses() {
        let html = "<p>Hello   <b>world</b></p>\n<p>again</p>";
        assert_eq!(strip_html(html), "Hello world again");
    }

    #[test]
    fn test_strip_html_decodes_entities() {
        assert_eq!(strip_html("Fish &amp; chips &lt;3"), "Fish & chips <3");
    }

    #[test]
    fn test_strip_html_plain_text_passthrough() {
        assert_eq!(strip_html("just text"), "just text");
    }

    #[test]
    fn test_truncate_chars_short_borrowed() {
        assert!(matches!(truncate_chars("short", 10), Cow::Borrowed("short")));
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        let s = "日本語のテキストです";
        let cut = truncate_chars(s, 6);
        assert_eq!(cut, "日本語...");
    }

    #[test]
    fn test_first_inline_image_double_quotes() {
        let html = r#"<p>Intro</p><img class="hero" src="https://cdn.example.com/a.jpg" alt="">"#;
        assert_eq!(
            first_inline_image(html).as_deref(),
            Some("https://cdn.example.com/a.jpg")
        );
    }

    #[test]
    fn test_first_inline_image_uppercase_and_single_quotes() {
        let html = "<IMG SRC='https://cdn.example.com/B.png'>";
        assert_eq!(
            first_inline_image(html).as_deref(),
            Some("https://cdn.example.com/B.png")
        );
    }

    #[test]
    fn test_first_inline_image_skips_img_without_src() {
        let html = r#"<img alt="x"><img src="https://cdn.example.com/c.gif"/>"#;
        assert_eq!(
            first_inline_image(html).as_deref(),
            Some("https://cdn.example.com/c.gif")
        );
    }

    #[test]
    fn test_first_inline_image_none() {
        assert!(first_inline_image("<p>No pictures</p>").is_none());
    }
}
