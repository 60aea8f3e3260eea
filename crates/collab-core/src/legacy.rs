//! Legacy content translation.
//!
//! Entities edited before collaboration existed store their body as HTML.
//! This module turns that HTML into the block structure used by the
//! document's `content` tree, and derives a plain-text fallback from it.
//!
//! Only block structure and text survive: inline markup (`<b>`, `<a>`, ...)
//! is flattened into the surrounding block's text.

use thiserror::Error;

/// Maximum block nesting accepted from legacy content.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LegacyError {
    #[error("Unterminated tag at byte {0}")]
    UnterminatedTag(usize),

    #[error("Block nesting deeper than {MAX_DEPTH}")]
    TooDeep,
}

pub type Result<T> = std::result::Result<T, LegacyError>;

/// Block types a content node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Heading(u8),
    Blockquote,
    CodeBlock,
    BulletList,
    OrderedList,
    ListItem,
}

impl BlockKind {
    /// Node `type` attribute stored in the document tree.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Paragraph => "paragraph",
            Self::Heading(_) => "heading",
            Self::Blockquote => "blockquote",
            Self::CodeBlock => "code_block",
            Self::BulletList => "bullet_list",
            Self::OrderedList => "ordered_list",
            Self::ListItem => "list_item",
        }
    }

    /// Inverse of [`type_name`](Self::type_name). Unknown types read as paragraphs.
    pub fn from_type_name(name: &str, level: Option<u8>) -> Self {
        match name {
            "heading" => Self::Heading(level.unwrap_or(1).clamp(1, 6)),
            "blockquote" => Self::Blockquote,
            "code_block" => Self::CodeBlock,
            "bullet_list" => Self::BulletList,
            "ordered_list" => Self::OrderedList,
            "list_item" => Self::ListItem,
            _ => Self::Paragraph,
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "p" | "div" => Self::Paragraph,
            "h1" => Self::Heading(1),
            "h2" => Self::Heading(2),
            "h3" => Self::Heading(3),
            "h4" => Self::Heading(4),
            "h5" => Self::Heading(5),
            "h6" => Self::Heading(6),
            "blockquote" => Self::Blockquote,
            "pre" => Self::CodeBlock,
            "ul" => Self::BulletList,
            "ol" => Self::OrderedList,
            "li" => Self::ListItem,
            _ => return None,
        })
    }

    /// Blocks that hold text directly and cannot contain other blocks.
    fn is_textblock(&self) -> bool {
        matches!(self, Self::Paragraph | Self::Heading(_) | Self::CodeBlock)
    }

    /// Blocks that only hold other blocks.
    fn is_container(&self) -> bool {
        matches!(self, Self::Blockquote | Self::BulletList | Self::OrderedList)
    }
}

/// One block of rich content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub text: String,
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            children: Vec::new(),
        }
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::new(BlockKind::Paragraph, text)
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.children = children;
        self
    }
}

enum Token<'a> {
    Open(String),
    Close(String),
    Text(&'a str),
}

/// Parse legacy HTML into blocks.
///
/// Text outside any block element becomes an implicit paragraph. Unclosed
/// block elements are closed at the end of input; stray closing tags are
/// ignored.
pub fn parse_html(html: &str) -> Result<Vec<Block>> {
    let tokens = tokenize(html)?;
    let mut root: Vec<Block> = Vec::new();
    let mut stack: Vec<Block> = Vec::new();

    for token in tokens {
        match token {
            Token::Text(raw) => {
                let in_pre = stack.iter().any(|b| b.kind == BlockKind::CodeBlock);
                let text = decode_entities(raw);
                let text = if in_pre { text } else { collapse_whitespace(&text) };

                let needs_paragraph = match stack.last() {
                    None => true,
                    Some(top) => top.kind.is_container(),
                };
                if needs_paragraph {
                    if text.trim().is_empty() {
                        continue;
                    }
                    push_block(&mut stack, Block::paragraph(""))?;
                }
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Token::Open(tag) if tag == "br" => {
                if let Some(top) = stack.last_mut() {
                    if !top.kind.is_container() {
                        top.text.push('\n');
                    }
                }
            }
            Token::Open(tag) => {
                let Some(kind) = BlockKind::from_tag(&tag) else {
                    continue;
                };
                // Text blocks never nest; a new block implicitly closes them.
                while stack.last().is_some_and(|top| {
                    top.kind.is_textblock() || (kind == BlockKind::ListItem && top.kind == kind)
                }) {
                    close_top(&mut stack, &mut root);
                }
                push_block(&mut stack, Block::new(kind, ""))?;
            }
            Token::Close(tag) => {
                let Some(kind) = BlockKind::from_tag(&tag) else {
                    continue;
                };
                if let Some(pos) = stack.iter().rposition(|b| same_element(b.kind, kind)) {
                    while stack.len() > pos {
                        close_top(&mut stack, &mut root);
                    }
                }
            }
        }
    }

    while !stack.is_empty() {
        close_top(&mut stack, &mut root);
    }

    Ok(root)
}

/// Plain-text rendering of blocks: one line per text-bearing block.
pub fn plain_text(blocks: &[Block]) -> String {
    let mut lines = Vec::new();
    collect_lines(blocks, &mut lines);
    lines.join("\n")
}

/// Plain-text fallback for stored legacy HTML.
///
/// Falls back to naive tag stripping when the HTML cannot be parsed.
pub fn html_to_plain_text(html: &str) -> String {
    match parse_html(html) {
        Ok(blocks) => plain_text(&blocks),
        Err(_) => strip_tags(html),
    }
}

/// Drop markup, keeping one line per block-level element. An unterminated
/// trailing tag is discarded.
fn strip_tags(html: &str) -> String {
    let mut out = String::new();
    let mut tag: Option<String> = None;
    for c in html.chars() {
        if let Some(inner) = tag.as_mut() {
            if c == '>' {
                if is_block_tag(inner) {
                    out.push('\n');
                }
                tag = None;
            } else {
                inner.push(c);
            }
        } else if c == '<' {
            tag = Some(String::new());
        } else {
            out.push(c);
        }
    }

    out.lines()
        .map(|line| decode_entities(collapse_whitespace(line).trim()))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_block_tag(inner: &str) -> bool {
    let name = tag_name(inner.trim_start().trim_start_matches('/'));
    matches!(
        name.as_str(),
        "p" | "div"
            | "br"
            | "li"
            | "ul"
            | "ol"
            | "blockquote"
            | "pre"
            | "tr"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
    )
}

fn collect_lines(blocks: &[Block], lines: &mut Vec<String>) {
    for block in blocks {
        if !block.kind.is_container() && !block.text.is_empty() {
            lines.push(block.text.clone());
        }
        collect_lines(&block.children, lines);
    }
}

fn same_element(a: BlockKind, b: BlockKind) -> bool {
    match (a, b) {
        (BlockKind::Heading(_), BlockKind::Heading(_)) => true,
        _ => a == b,
    }
}

fn push_block(stack: &mut Vec<Block>, block: Block) -> Result<()> {
    if stack.len() >= MAX_DEPTH {
        return Err(LegacyError::TooDeep);
    }
    stack.push(block);
    Ok(())
}

fn close_top(stack: &mut Vec<Block>, root: &mut Vec<Block>) {
    let Some(mut block) = stack.pop() else {
        return;
    };
    if block.kind != BlockKind::CodeBlock {
        block.text = block.text.trim().to_string();
    }
    match stack.last_mut() {
        Some(parent) => parent.children.push(block),
        None => root.push(block),
    }
}

fn tokenize(html: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut rest = html;
    let mut offset = 0;

    while !rest.is_empty() {
        match rest.find('<') {
            Some(0) => {
                if let Some(after) = rest.strip_prefix("<!--") {
                    let end = after
                        .find("-->")
                        .ok_or(LegacyError::UnterminatedTag(offset))?;
                    let consumed = 4 + end + 3;
                    rest = &rest[consumed..];
                    offset += consumed;
                    continue;
                }

                let end = rest.find('>').ok_or(LegacyError::UnterminatedTag(offset))?;
                let inner = rest[1..end].trim();
                if let Some(name) = inner.strip_prefix('/') {
                    tokens.push(Token::Close(tag_name(name)));
                } else if !inner.starts_with('!') && !inner.starts_with('?') {
                    tokens.push(Token::Open(tag_name(inner)));
                }
                rest = &rest[end + 1..];
                offset += end + 1;
            }
            Some(pos) => {
                tokens.push(Token::Text(&rest[..pos]));
                rest = &rest[pos..];
                offset += pos;
            }
            None => {
                tokens.push(Token::Text(rest));
                break;
            }
        }
    }

    Ok(tokens)
}

fn tag_name(inner: &str) -> String {
    inner
        .split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c.is_whitespace() && c != '\u{a0}' {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            c.map(|c| (c, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
