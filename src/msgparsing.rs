//! Parsing of the Slack message wire format.
//!
//! Slack text interleaves plain runs, ```preformatted blocks```, and
//! angle-bracket items (`<@user>`, `<#channel|name>`, `<!here>`, links).
//! Everything here is pure string processing; no I/O.

/// Plain char ↔ wire entity pairs. The wire side escapes these three and
/// nothing else.
pub const SLACK_SUBSTITUTIONS: [(&str, &str); 3] =
    [("&", "&amp;"), ("<", "&lt;"), (">", "&gt;")];

/// Wire → plain text. `&amp;` is decoded last so that an escaped escape
/// (`&amp;gt;`) comes out as the literal `&gt;`.
pub fn decode_entities(msg: &str) -> String {
    msg.replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Plain text → wire. `&` is encoded first for the same reason.
pub fn encode_entities(msg: &str) -> String {
    msg.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// `<!here>`, `<!channel>`, `<!everyone>`
    Yell,
    /// `<@USERID>`
    Mention,
    /// `<#CHANNELID|name>`
    Channel,
    /// Anything else, in practice a link
    Other,
}

/// One `<...>` item from the wire, already split into value and label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialItem {
    pub kind: ItemKind,
    pub val: String,
    pub human: Option<String>,
}

impl SpecialItem {
    /// `token` includes the surrounding brackets.
    fn parse(token: &str) -> SpecialItem {
        let inner = &token[1..token.len() - 1];
        let (kind, rest) = match inner.chars().next() {
            Some('!') => (ItemKind::Yell, &inner[1..]),
            Some('@') => (ItemKind::Mention, &inner[1..]),
            Some('#') => (ItemKind::Channel, &inner[1..]),
            _ => (ItemKind::Other, inner),
        };
        let (val, human) = match rest.split_once('|') {
            Some((v, h)) => (v.to_string(), Some(h.to_string())),
            None => (rest.to_string(), None),
        };
        SpecialItem { kind, val, human }
    }
}

/// A ``` fenced block, fences removed, entities decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreBlock {
    pub txt: String,
}

impl PreBlock {
    pub fn lines(&self) -> usize {
        self.txt.matches('\n').count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Pre(PreBlock),
    Special(SpecialItem),
}

/// Alternating (segment, preformatted?) pairs. The ``` fences themselves are
/// consumed; an unterminated fence opens a preformatted run to end of input.
fn preblocks(msg: &str) -> Vec<(&str, bool)> {
    let mut out = Vec::new();
    let mut pre = false;
    let mut rest = msg;
    while let Some(p) = rest.find("```") {
        out.push((&rest[..p], pre));
        pre = !pre;
        rest = &rest[p + 3..];
    }
    out.push((rest, pre));
    out
}

enum RawPiece<'a> {
    Text(&'a str),
    Special(&'a str),
}

/// Split a non-preformatted segment into plain runs and bracketed items.
/// A `<` with no closing `>` is plain text.
fn split_tokens(msg: &str) -> Vec<RawPiece<'_>> {
    let mut out = Vec::new();
    let mut rest = msg;
    while let Some(begin) = rest.find('<') {
        if begin != 0 {
            out.push(RawPiece::Text(&rest[..begin]));
            rest = &rest[begin..];
        } else {
            match rest.find('>') {
                Some(end) => {
                    out.push(RawPiece::Special(&rest[..=end]));
                    rest = &rest[end + 1..];
                }
                None => break,
            }
        }
    }
    if !rest.is_empty() {
        out.push(RawPiece::Text(rest));
    }
    out
}

/// Render a preformatted segment. Links get unwrapped to their label or
/// target; mention/channel/yell items are not interpreted inside a fence and
/// stay as literal text.
fn convertpre(msg: &str) -> String {
    let mut out = String::new();
    for piece in split_tokens(msg) {
        match piece {
            RawPiece::Text(t) => out.push_str(t),
            RawPiece::Special(raw) => {
                let item = SpecialItem::parse(raw);
                if item.kind == ItemKind::Other {
                    out.push_str(item.human.as_deref().unwrap_or(&item.val));
                } else {
                    out.push_str(raw);
                }
            }
        }
    }
    decode_entities(&out)
}

/// Expand `:alias:` emoji codes that resolve in the shortcode table;
/// unknown aliases pass through untouched.
fn expand_emoji(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(':') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let alias_end = after.find(':');
        let expanded = alias_end.and_then(|end| {
            let alias = &after[..end];
            let plausible = !alias.is_empty()
                && alias
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+'));
            if plausible {
                emojis::get_by_shortcode(alias).map(|e| (e.as_str(), end))
            } else {
                None
            }
        });
        match expanded {
            Some((emoji, end)) => {
                out.push_str(emoji);
                rest = &after[end + 1..];
            }
            None => {
                out.push(':');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Tokenize a whole wire message. Total on any input.
pub fn tokenize(msg: &str) -> Vec<Token> {
    let mut out = Vec::new();
    for (segment, pre) in preblocks(msg) {
        if pre {
            out.push(Token::Pre(PreBlock {
                txt: convertpre(segment),
            }));
        } else {
            for piece in split_tokens(segment) {
                match piece {
                    RawPiece::Text(t) => {
                        out.push(Token::Text(expand_emoji(&decode_entities(t))));
                    }
                    RawPiece::Special(raw) => {
                        out.push(Token::Special(SpecialItem::parse(raw)));
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Token {
        Token::Text(s.to_string())
    }

    fn pre(s: &str) -> Token {
        Token::Pre(PreBlock { txt: s.to_string() })
    }

    #[test]
    fn test_preblocks() {
        assert_eq!(preblocks(""), vec![("", false)]);
        assert_eq!(preblocks("asd"), vec![("asd", false)]);
        assert_eq!(
            preblocks("a ```a``` a"),
            vec![("a ", false), ("a", true), (" a", false)]
        );
        assert_eq!(
            preblocks("```a``` a"),
            vec![("", false), ("a", true), (" a", false)]
        );
        assert_eq!(preblocks("```a"), vec![("", false), ("a", true)]);
    }

    #[test]
    fn test_special_item() {
        let c = SpecialItem::parse("<@ciccio>");
        assert_eq!(c.kind, ItemKind::Mention);
        assert_eq!(c.human, None);
        assert_eq!(c.val, "ciccio");

        let c = SpecialItem::parse("<http://ciccio|link>");
        assert_eq!(c.kind, ItemKind::Other);
        assert_eq!(c.human.as_deref(), Some("link"));
        assert_eq!(c.val, "http://ciccio");

        let c = SpecialItem::parse("<#ciccio>");
        assert_eq!(c.kind, ItemKind::Channel);
        assert_eq!(c.val, "ciccio");

        let c = SpecialItem::parse("<!here>");
        assert_eq!(c.kind, ItemKind::Yell);
        assert_eq!(c.val, "here");
    }

    #[test]
    fn test_convertpre() {
        assert_eq!(convertpre("asd"), "asd");
        assert_eq!(convertpre("asd <http://ciccio> &gt;"), "asd http://ciccio >");
        // Mentions are not interpreted inside a preformatted block
        assert_eq!(convertpre("<@U123> hi"), "<@U123> hi");
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("a"), vec![text("a")]);
        assert_eq!(tokenize("a ```ciao```"), vec![text("a "), pre("ciao")]);
        assert_eq!(tokenize(":coffin:"), vec![text("\u{26B0}\u{FE0F}")]);
        assert_eq!(tokenize("&gt;"), vec![text(">")]);
        assert_eq!(
            tokenize("a <b> <c> d ```<http://ciccio>```"),
            vec![
                text("a "),
                Token::Special(SpecialItem::parse("<b>")),
                text(" "),
                Token::Special(SpecialItem::parse("<c>")),
                text(" d "),
                pre("http://ciccio"),
            ]
        );
    }

    #[test]
    fn test_tokenize_links_and_yells() {
        assert_eq!(
            tokenize("See <https://e.com/|docs>. <!here>"),
            vec![
                text("See "),
                Token::Special(SpecialItem {
                    kind: ItemKind::Other,
                    val: "https://e.com/".to_string(),
                    human: Some("docs".to_string()),
                }),
                text(". "),
                Token::Special(SpecialItem {
                    kind: ItemKind::Yell,
                    val: "here".to_string(),
                    human: None,
                }),
            ]
        );
    }

    #[test]
    fn test_unclosed_bracket_is_text() {
        assert_eq!(tokenize("a < b"), vec![text("a "), text("< b")]);
    }

    #[test]
    fn test_unknown_emoji_passes_through() {
        assert_eq!(
            tokenize(":surely_not_an_emoji:"),
            vec![text(":surely_not_an_emoji:")]
        );
    }

    #[test]
    fn test_entity_roundtrip() {
        assert_eq!(decode_entities(&encode_entities("a < b && c > d")), "a < b && c > d");
        // An escaped escape decodes to the literal entity
        assert_eq!(decode_entities("&amp;gt;"), "&gt;");
    }

    #[test]
    fn test_preblock_lines() {
        let t = tokenize("```a\nb\nc```");
        match &t[1] {
            Token::Pre(p) => assert_eq!(p.lines(), 2),
            other => panic!("expected preblock, got {other:?}"),
        }
    }
}
