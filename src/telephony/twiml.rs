//! TwiML documents returned by the voice webhook.

/// Media-stream URL for a public host.
///
/// Accepts a bare host or a URL with an `http(s)`/`ws(s)` scheme and always
/// produces a secure WebSocket URL ending in `/stream`.
pub fn stream_url(host: &str) -> String {
    let bare = host
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_end_matches('/');
    format!("wss://{}/stream", bare)
}

/// Greet the caller, then connect the call audio to `stream_url`.
pub fn connect_stream(greeting: Option<&str>, stream_url: &str) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
    if let Some(text) = greeting.filter(|text| !text.trim().is_empty()) {
        xml.push_str("<Say>");
        xml.push_str(&escape_xml(text));
        xml.push_str("</Say>");
    }
    xml.push_str(r#"<Connect><Stream url=""#);
    xml.push_str(&escape_xml(stream_url));
    xml.push_str(r#""/></Connect></Response>"#);
    xml
}

/// Apology played when the call cannot be connected.
pub fn failure(message: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Response><Say>{}</Say></Response>"#,
        escape_xml(message)
    )
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_normalizes_scheme() {
        assert_eq!(stream_url("relay.example.com"), "wss://relay.example.com/stream");
        assert_eq!(stream_url("https://relay.example.com/"), "wss://relay.example.com/stream");
        assert_eq!(stream_url("ws://localhost:8080"), "wss://localhost:8080/stream");
    }

    #[test]
    fn test_connect_stream_document() {
        let xml = connect_stream(Some("Hi & welcome"), "wss://h/stream");
        assert!(xml.contains("<Say>Hi &amp; welcome</Say>"));
        assert!(xml.contains(r#"<Connect><Stream url="wss://h/stream"/></Connect>"#));
        assert!(xml.ends_with("</Response>"));
    }

    #[test]
    fn test_blank_greeting_is_skipped() {
        let xml = connect_stream(Some("  "), "wss://h/stream");
        assert!(!xml.contains("<Say>"));
    }

    #[test]
    fn test_failure_document() {
        assert!(failure("Sorry <again>").contains("<Say>Sorry &lt;again&gt;</Say>"));
    }
}
