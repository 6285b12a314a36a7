//! Bubble body walker.

use std::collections::HashSet;

use crate::markup::{find_element, Element, MarkupNode, MatchCriterion};

use super::{BubbleContent, ContentError, ContentResult, FilterReason, MessageKind};

const BOT_COMMAND_PREFIX: &str = "tg://bot_command?command=";

/// Stand-in for custom stickers that have no emoji alternative.
const UNKNOWN_STICKER: &str = "❓";

/// Substrings left behind when the client mangles a surrogate pair.
const LONE_SURROGATE_MARKERS: &[&str] = &["\u{90}X\u{83c}", "\u{FFFD}"];

/// Formatting tags rendered inside links and emphasis.
const NESTED_FORMATTING: &[&str] = &["em", "strong", "u"];

/// Classifies parsed bubbles.
#[derive(Debug, Clone, Default)]
pub struct ContentExtractor {
    service_allow_list: HashSet<String>,
}

/// What one child of the message body contributes.
enum BodyPart {
    Text(String),
    Nothing,
    ReplyQuote,
    EditMarker,
    Filter(FilterReason),
}

/// Why clean rendering of an inline element stopped.
enum RenderError {
    NestedLink,
    Spoiler,
    Unknown(ContentError),
}

impl From<ContentError> for RenderError {
    fn from(err: ContentError) -> Self {
        RenderError::Unknown(err)
    }
}

impl From<crate::markup::MarkupError> for RenderError {
    fn from(err: crate::markup::MarkupError) -> Self {
        RenderError::Unknown(err.into())
    }
}

impl ContentExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tolerate service bubbles with these message ids.
    pub fn with_service_allow_list<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service_allow_list: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allow_listed(&self, message_id: Option<&str>) -> bool {
        message_id.is_some_and(|id| self.service_allow_list.contains(id))
    }

    /// Whether the bubble is a service notice rather than a message.
    pub fn is_service(&self, tree: &MarkupNode) -> ContentResult<bool> {
        Ok(bubble_element(tree)?.has_class("service"))
    }

    /// Classify the bubble in `tree`, a closed single-element document.
    pub fn extract(&self, tree: &MarkupNode) -> ContentResult<BubbleContent> {
        let bubble = bubble_element(tree)?;

        if bubble.has_class("service") {
            let message_id = bubble.attr("data-mid")?;
            if self.is_allow_listed(message_id) {
                return Ok(BubbleContent::Filtered(FilterReason::ServiceItem));
            }
            return Err(ContentError::UnexpectedServiceItem {
                message_id: message_id.map(str::to_string),
            });
        }

        let kind = if bubble.has_class("channel-post") {
            Some(MessageKind::ChannelPost)
        } else if bubble.has_class("is-in") {
            Some(MessageKind::Comment)
        } else {
            None
        };

        let message = find_element(tree, &[MatchCriterion::element("div").with_class("message")])?
            .as_element()
            .ok_or_else(|| ContentError::NotABubble("'.message' is not an element".into()))?;

        // Whole-item filters win over anything else in the body, including
        // shapes that would otherwise be rejected as unknown.
        for child in message.children.iter().filter_map(MarkupNode::as_element) {
            if let Some(reason) = whole_item_filter(child) {
                return Ok(BubbleContent::Filtered(reason));
            }
        }

        let mut text = String::new();
        let mut is_reply = false;
        let mut was_edited = false;
        for child in &message.children {
            let el = match child {
                MarkupNode::Text(data) => {
                    text.push_str(data);
                    continue;
                }
                MarkupNode::Element(el) => el,
                MarkupNode::Root(_) => return Err(unknown_structure(child)),
            };
            match body_part(el)? {
                BodyPart::Text(fragment) => text.push_str(&fragment),
                BodyPart::Nothing => {}
                BodyPart::ReplyQuote => is_reply = true,
                BodyPart::EditMarker => was_edited = true,
                BodyPart::Filter(reason) => return Ok(BubbleContent::Filtered(reason)),
            }
        }

        if LONE_SURROGATE_MARKERS.iter().any(|m| text.contains(m)) {
            return Ok(BubbleContent::Filtered(FilterReason::ProbableLoneSurrogate));
        }

        Ok(BubbleContent::Extracted {
            text,
            kind,
            is_reply,
            was_edited,
        })
    }
}

/// The top-level `div.bubble` of a closed document.
pub(crate) fn bubble_element(tree: &MarkupNode) -> ContentResult<&Element> {
    let top = tree.top_element()?;
    if top.tag != "div" || !top.has_class("bubble") {
        return Err(ContentError::NotABubble(format!("<{}>", top.tag)));
    }
    Ok(top)
}

fn unknown_structure(node: &MarkupNode) -> ContentError {
    ContentError::UnknownStructure {
        tree: node.to_string(),
    }
}

fn unknown_element(el: &Element) -> ContentError {
    ContentError::UnknownStructure {
        tree: el.to_string(),
    }
}

/// Body shapes that disqualify the whole bubble.
fn whole_item_filter(el: &Element) -> Option<FilterReason> {
    match el.tag.as_str() {
        "poll-element" => Some(FilterReason::Poll),
        "blockquote" => Some(FilterReason::Blockquote),
        "span" if el.has_class("i18n") => Some(FilterReason::I18n),
        "div" if el.has_class("geo-footer") => Some(FilterReason::GeoFooter),
        "div" if el.has_class("document-container") => document_filter(el),
        _ => None,
    }
}

fn document_filter(container: &Element) -> Option<FilterReason> {
    let is_audio_wrapper = |wrapper: Option<&Element>| {
        wrapper.is_some_and(|w| {
            w.is("div")
                && w.has_class("document-wrapper")
                && w.child_element(0).is_some_and(|c| c.is("audio-element"))
        })
    };
    if is_audio_wrapper(container.child_element(0)) || is_audio_wrapper(container.child_element(1)) {
        return Some(FilterReason::AudioDocument);
    }

    let first = container.child_element(0)?;
    let inner = first.child_element(0)?;
    if first.is("div") && inner.is("div") && inner.has_class("document-message") {
        return Some(FilterReason::DocumentMessage);
    }
    None
}

fn body_part(el: &Element) -> ContentResult<BodyPart> {
    if let Some(reason) = whole_item_filter(el) {
        return Ok(BodyPart::Filter(reason));
    }

    let part = match el.tag.as_str() {
        "a" => {
            let href = el.attr("href")?.unwrap_or_default();
            if href.starts_with(BOT_COMMAND_PREFIX)
                || (el.has_class("webpage") && el.has_class("quote-like"))
                || (el.has_class("btn-primary") && el.has_class("bubble-view-button"))
            {
                BodyPart::Nothing
            } else {
                match render_clean(el, false) {
                    Ok(fragment) => BodyPart::Text(fragment),
                    Err(RenderError::NestedLink) => BodyPart::Filter(FilterReason::NestedLink),
                    Err(RenderError::Spoiler) => {
                        BodyPart::Filter(FilterReason::ComplexFormattingInLink)
                    }
                    Err(RenderError::Unknown(err)) => return Err(err),
                }
            }
        }
        "em" | "strong" | "code" | "u" => match render_clean(el, false) {
            Ok(fragment) => BodyPart::Text(fragment),
            Err(RenderError::NestedLink) => BodyPart::Filter(FilterReason::FormattedLink),
            Err(RenderError::Spoiler) => BodyPart::Filter(FilterReason::ComplexFormattingInLink),
            Err(RenderError::Unknown(err)) => return Err(err),
        },
        "span" if el.has_class("spoiler") => {
            let hidden = match el.children.as_slice() {
                [MarkupNode::Element(inner)] if inner.is("span") && inner.has_class("spoiler-text") => {
                    inner
                }
                _ => return Err(unknown_element(el)),
            };
            match render_clean(hidden, true) {
                Ok(fragment) => BodyPart::Text(fragment),
                Err(RenderError::NestedLink) => BodyPart::Filter(FilterReason::NestedLink),
                Err(RenderError::Spoiler) => {
                    BodyPart::Filter(FilterReason::ComplexFormattingInLink)
                }
                Err(RenderError::Unknown(err)) => return Err(err),
            }
        }
        "span" if el.has_class("time") => BodyPart::Nothing,
        "img" if el.has_class("emoji") => BodyPart::Text(required_attr(el, "alt")?.to_string()),
        "div" if el.has_class("reply") && el.has_class("quote-like") => BodyPart::ReplyQuote,
        "del" => BodyPart::EditMarker,
        "custom-emoji-renderer-element" if el.has_class("custom-emoji-renderer") => {
            if el.has_attr("data-sticker-emoji") {
                return Err(unknown_element(el));
            }
            BodyPart::Text(UNKNOWN_STICKER.to_string())
        }
        "custom-emoji-element" => match el.attr("data-sticker-emoji")? {
            Some(emoji) => BodyPart::Text(emoji.to_string()),
            None => return Err(unknown_element(el)),
        },
        "reactions-element" => BodyPart::Nothing,
        "div" if el.has_class("web") => match el.children.as_slice() {
            [MarkupNode::Element(quote)] if quote.is("div") && quote.has_class("quote") => {
                BodyPart::Nothing
            }
            _ => return Err(unknown_element(el)),
        },
        "div" if el.has_class("contact") => BodyPart::Nothing,
        _ => return Err(unknown_element(el)),
    };
    Ok(part)
}

/// Render an inline element as text, keeping bare formatting tags.
fn render_clean(el: &Element, children_only: bool) -> Result<String, RenderError> {
    let mut out = String::new();
    if !children_only {
        out.push('<');
        out.push_str(&el.tag);
        out.push('>');
    }
    for child in &el.children {
        let inner = match child {
            MarkupNode::Text(data) => {
                out.push_str(data);
                continue;
            }
            MarkupNode::Element(inner) => inner,
            MarkupNode::Root(_) => return Err(unknown_structure(child).into()),
        };
        match inner.tag.as_str() {
            "img" if inner.has_class("emoji") => out.push_str(required_attr(inner, "alt")?),
            tag if NESTED_FORMATTING.contains(&tag) => out.push_str(&render_clean(inner, false)?),
            "a" => return Err(RenderError::NestedLink),
            "del" => {}
            "custom-emoji-element" if inner.has_class("custom-emoji") => {
                out.push_str(required_attr(inner, "data-sticker-emoji")?)
            }
            "span" if inner.has_class("spoiler") => return Err(RenderError::Spoiler),
            _ => return Err(unknown_element(inner).into()),
        }
    }
    if !children_only {
        out.push_str("</");
        out.push_str(&el.tag);
        out.push('>');
    }
    Ok(out)
}

fn required_attr<'a>(el: &'a Element, name: &'static str) -> ContentResult<&'a str> {
    el.attr(name)?.ok_or_else(|| ContentError::MissingAttribute {
        tag: el.tag.clone(),
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::MarkupParser;

    fn extract(body: &str) -> ContentResult<BubbleContent> {
        extract_bubble("bubble is-in", body)
    }

    fn extract_bubble(classes: &str, body: &str) -> ContentResult<BubbleContent> {
        let markup = format!(
            r#"<div class="{}" data-mid="7"><div class="message">{}</div></div>"#,
            classes, body
        );
        let tree = MarkupParser::new().parse(&markup).unwrap();
        ContentExtractor::new().extract(&tree)
    }

    #[test]
    fn test_plain_message() {
        let tree = MarkupParser::new()
            .parse(r#"<div class="bubble"><div class="message">Hello</div></div>"#)
            .unwrap();
        let content = ContentExtractor::new().extract(&tree).unwrap();
        assert_eq!(content.text(), Some("Hello"));
        assert_eq!(content.filter_reason(), None);
        assert_eq!(content.kind(), None);
    }

    #[test]
    fn test_kind_from_class_markers() {
        let post = extract_bubble("bubble channel-post is-in", "x").unwrap();
        assert_eq!(post.kind(), Some(MessageKind::ChannelPost));
        let comment = extract_bubble("bubble is-in", "x").unwrap();
        assert_eq!(comment.kind(), Some(MessageKind::Comment));
    }

    #[test]
    fn test_poll_wins_regardless_of_siblings() {
        let content = extract(r#"Vote!<poll-element></poll-element><marquee>odd</marquee>"#).unwrap();
        assert_eq!(content.filter_reason(), Some(FilterReason::Poll));
        assert_eq!(content.text(), None);

        let content = extract(r#"<marquee>odd</marquee><poll-element></poll-element>"#).unwrap();
        assert_eq!(content.filter_reason(), Some(FilterReason::Poll));
    }

    #[test]
    fn test_whole_item_filters() {
        let cases = [
            (r#"<div class="geo-footer">x</div>"#, FilterReason::GeoFooter),
            (r#"<span class="i18n">Photo</span>"#, FilterReason::I18n),
            ("<blockquote>q</blockquote>", FilterReason::Blockquote),
            (
                r#"<div class="document-container"><div class="document-wrapper"><audio-element></audio-element></div></div>"#,
                FilterReason::AudioDocument,
            ),
            (
                r#"<div class="document-container"><div class="x"></div><div class="document-wrapper"><audio-element></audio-element></div></div>"#,
                FilterReason::AudioDocument,
            ),
            (
                r#"<div class="document-container"><div><div class="document-message">f</div></div></div>"#,
                FilterReason::DocumentMessage,
            ),
        ];
        for (body, reason) in cases {
            assert_eq!(extract(body).unwrap().filter_reason(), Some(reason), "{}", body);
        }
    }

    #[test]
    fn test_inline_formatting_and_emoji() {
        let content = extract(
            r#"Hi <strong>bold <em>both</em></strong> <img class="emoji" alt="🙂" src="x.png"><span class="time">12:00</span><reactions-element></reactions-element>"#,
        )
        .unwrap();
        assert_eq!(
            content.text(),
            Some("Hi <strong>bold <em>both</em></strong> 🙂")
        );
    }

    #[test]
    fn test_links() {
        let content = extract(
            r#"<a href="https://example.com" class="anchor-url">site</a> <a href="tg://bot_command?command=start">/start</a><a href="mailto:a@b.c">mail</a>"#,
        )
        .unwrap();
        assert_eq!(content.text(), Some("<a>site</a> <a>mail</a>"));
    }

    #[test]
    fn test_link_violations_degrade_to_filtered() {
        let nested = extract(r#"<a href="x">a <a href="y">b</a></a>"#).unwrap();
        assert_eq!(nested.filter_reason(), Some(FilterReason::NestedLink));

        let spoiler = extract(r#"<a href="x"><span class="spoiler">s</span></a>"#).unwrap();
        assert_eq!(
            spoiler.filter_reason(),
            Some(FilterReason::ComplexFormattingInLink)
        );

        let formatted = extract(r#"<em>see <a href="x">here</a></em>"#).unwrap();
        assert_eq!(formatted.filter_reason(), Some(FilterReason::FormattedLink));
    }

    #[test]
    fn test_spoiler_text_is_kept() {
        let content = extract(
            r#"before <span class="spoiler"><span class="spoiler-text">hidden</span></span>"#,
        )
        .unwrap();
        assert_eq!(content.text(), Some("before hidden"));
    }

    #[test]
    fn test_reply_and_edit_markers() {
        let content = extract(
            r#"<div class="reply quote-like">quoted</div>text<del>old</del>"#,
        )
        .unwrap();
        assert!(content.is_reply());
        assert!(content.was_edited());
        assert_eq!(content.text(), Some("text"));
    }

    #[test]
    fn test_custom_emoji() {
        let content = extract(
            r#"<custom-emoji-element data-sticker-emoji="🔥"></custom-emoji-element><custom-emoji-renderer-element class="custom-emoji-renderer"></custom-emoji-renderer-element>"#,
        )
        .unwrap();
        assert_eq!(content.text(), Some("🔥❓"));
    }

    #[test]
    fn test_skipped_attachments() {
        let content = extract(
            r#"<div class="web"><div class="quote">preview</div></div><div class="contact">c</div><a class="webpage quote-like" href="x">w</a>ok"#,
        )
        .unwrap();
        assert_eq!(content.text(), Some("ok"));
    }

    #[test]
    fn test_unknown_structure_is_fatal() {
        let err = extract("<marquee>hello</marquee>").unwrap_err();
        assert!(matches!(err, ContentError::UnknownStructure { .. }));
        assert!(err.to_string().contains("marquee"));
    }

    #[test]
    fn test_broken_surrogate_is_filtered() {
        let content = extract("abc\u{90}X\u{83c}def").unwrap();
        assert_eq!(
            content.filter_reason(),
            Some(FilterReason::ProbableLoneSurrogate)
        );
        let content = extract("lossy \u{FFFD}").unwrap();
        assert_eq!(
            content.filter_reason(),
            Some(FilterReason::ProbableLoneSurrogate)
        );
    }

    #[test]
    fn test_service_bubbles() {
        let tree = MarkupParser::new()
            .parse(r#"<div class="bubble service" data-mid="99"><div class="message">joined</div></div>"#)
            .unwrap();
        assert!(matches!(
            ContentExtractor::new().extract(&tree),
            Err(ContentError::UnexpectedServiceItem { .. })
        ));

        let allowing = ContentExtractor::with_service_allow_list(["99"]);
        assert_eq!(
            allowing.extract(&tree).unwrap().filter_reason(),
            Some(FilterReason::ServiceItem)
        );
        assert!(allowing.is_service(&tree).unwrap());
    }

    #[test]
    fn test_non_bubble_is_rejected() {
        let tree = MarkupParser::new().parse("<p>x</p>").unwrap();
        assert!(matches!(
            ContentExtractor::new().extract(&tree),
            Err(ContentError::NotABubble(_))
        ));
    }
}
