//! Minimal XML helpers for the flat documents the bulk API exchanges.
//!
//! Responses are shallow (`<jobInfo><id>..</id><state>..</state></jobInfo>`),
//! so element text is located by tag name rather than by a full parser.

/// Text of every `<tag>` element, in document order, unescaped.
pub fn tag_values(doc: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut out = Vec::new();
    let mut rest = doc;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        out.push(unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    out
}

/// Text of the first `<tag>` element.
pub fn tag_value(doc: &str, tag: &str) -> Option<String> {
    tag_values(doc, tag).into_iter().next()
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_values_in_order() {
        let doc = "<result-list><result>752x0</result><result>752x1</result></result-list>";
        assert_eq!(tag_values(doc, "result"), vec!["752x0", "752x1"]);
        assert_eq!(tag_value(doc, "missing"), None);
    }

    #[test]
    fn test_escape_round_trip() {
        let text = "a < b & \"c\"";
        assert_eq!(unescape(&escape(text)), text);
        assert_eq!(escape("R&D"), "R&amp;D");
    }
}
