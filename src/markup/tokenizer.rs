//! Markup events from html5ever's tokenizer.
//!
//! Only the tokenizer is used: it handles character references, attribute
//! quoting and comments, and never fails. The tree is built by
//! [`MarkupParser`](super::MarkupParser), which decides what tag soup means.

use std::cell::RefCell;

use html5ever::tendril::StrTendril;
use html5ever::tokenizer::states::RawKind;
use html5ever::tokenizer::{
    BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
};

/// One structural event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupEvent {
    Open {
        tag: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close {
        tag: String,
    },
    Text(String),
}

/// Elements that never have content and are closed by the event consumer
/// right after opening.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

/// Collects tokens as events. Adjacent character tokens are joined into one
/// text event.
#[derive(Default)]
struct EventSink {
    events: RefCell<Vec<MarkupEvent>>,
    text: RefCell<String>,
}

impl EventSink {
    fn flush_text(&self) {
        let mut text = self.text.borrow_mut();
        if !text.is_empty() {
            self.events
                .borrow_mut()
                .push(MarkupEvent::Text(std::mem::take(&mut *text)));
        }
    }

    fn push_tag(&self, tag: Tag) -> TokenSinkResult<()> {
        self.flush_text();
        let name = tag.name.to_string();
        match tag.kind {
            TagKind::StartTag => {
                let raw = match name.as_str() {
                    "script" if !tag.self_closing => Some(RawKind::ScriptData),
                    "style" if !tag.self_closing => Some(RawKind::Rawtext),
                    _ => None,
                };
                self.events.borrow_mut().push(MarkupEvent::Open {
                    tag: name,
                    attrs: tag
                        .attrs
                        .iter()
                        .map(|attr| (attr.name.local.to_string(), attr.value.to_string()))
                        .collect(),
                    self_closing: tag.self_closing,
                });
                match raw {
                    Some(kind) => TokenSinkResult::RawData(kind),
                    None => TokenSinkResult::Continue,
                }
            }
            TagKind::EndTag => {
                self.events.borrow_mut().push(MarkupEvent::Close { tag: name });
                TokenSinkResult::Continue
            }
        }
    }
}

impl TokenSink for EventSink {
    type Handle = ();

    fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
        match token {
            Token::TagToken(tag) => return self.push_tag(tag),
            Token::CharacterTokens(chars) => self.text.borrow_mut().push_str(&chars),
            Token::EOFToken => self.flush_text(),
            // Comments, doctypes, NUL characters and parse errors carry no
            // structure.
            _ => {}
        }
        TokenSinkResult::Continue
    }
}

/// Tokenize a complete markup string.
///
/// Tag and attribute names come out lowercase and character references are
/// decoded. When an attribute name repeats on one tag only the first value
/// is kept.
pub fn tokenize(input: &str) -> Vec<MarkupEvent> {
    let queue = BufferQueue::default();
    queue.push_back(StrTendril::from_slice(input));

    let tokenizer = Tokenizer::new(EventSink::default(), TokenizerOpts::default());
    let _ = tokenizer.feed(&queue);
    tokenizer.end();

    tokenizer.sink.flush_text();
    tokenizer.sink.events.take()
}
