//! Thin adapters from [`SessionEvent`]s to something a person can read.

use crate::citations::CitationSet;
use crate::dispatcher::{BusyIndicator, SessionEvent};
use crate::types::{ChatMessage, Role};
use comrak::plugins::syntect::SyntectAdapter;
use comrak::{ComrakOptions, ComrakPlugins, markdown_to_html_with_plugins};
use once_cell::sync::Lazy;
use std::fmt::Write as _;
use std::io::{self, Write};

static MARKDOWN_OPTIONS: Lazy<ComrakOptions> = Lazy::new(|| {
    let mut options = ComrakOptions::default();
    options.extension.table = true;
    options.extension.strikethrough = true;
    options.extension.autolink = true;
    options
});

/// Renders an answer's markdown to HTML. Raw HTML from the model is omitted.
pub fn format_message(md: &str) -> String {
    if md.is_empty() {
        return String::new();
    }
    let adapter = SyntectAdapter::new(Some("base16-ocean.dark"));
    let mut plugins = ComrakPlugins::default();
    plugins.render.codefence_syntax_highlighter = Some(&adapter);
    markdown_to_html_with_plugins(md, &MARKDOWN_OPTIONS, &plugins)
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Standalone HTML page with the conversation and its latest citations.
pub fn transcript_html(messages: &[ChatMessage], citations: Option<&CitationSet>) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Home Affairs AI Assistant</title></head><body>\n<div class=\"chat-messages\">\n",
    );
    for message in messages {
        let (class, body) = match message.role {
            Role::User => ("user", format!("<p>{}</p>", escape_html(&message.content))),
            Role::Assistant => ("assistant", format_message(&message.content)),
        };
        let _ = writeln!(
            html,
            "<div class=\"message message-{class}\"><div class=\"message-content\">{body}</div></div>"
        );
    }
    html.push_str("</div>\n<div class=\"citation-list\">\n");

    match citations {
        Some(set) if set.opens_panel() => {
            for (index, citation) in set.citations().iter().enumerate() {
                let url = escape_html(&citation.url);
                let link = if citation.is_navigable() {
                    format!(
                        "<a href=\"{url}\" target=\"_blank\" rel=\"noopener noreferrer\" class=\"citation-url\">{url}</a>"
                    )
                } else {
                    "<span class=\"citation-url\">No link available</span>".to_string()
                };
                let _ = writeln!(
                    html,
                    "<div class=\"citation-item\"><div class=\"citation-number\">{}</div><div class=\"citation-content\"><div class=\"citation-title\">{}</div>{link}</div></div>",
                    index + 1,
                    escape_html(&citation.title),
                );
            }
        }
        Some(set) => {
            let notice = set.empty_notice().unwrap_or_default();
            let _ = writeln!(html, "<div class=\"no-citations\"><p>{notice}</p></div>");
        }
        None => {}
    }
    html.push_str("</div>\n</body></html>\n");
    html
}

/// Prints a live transcript to a terminal-like sink.
///
/// Updates arrive as full replacements; the terminal can only append, so the
/// renderer prints the new suffix, or the whole message again when the text
/// was rewritten.
pub struct TerminalRenderer<W: Write> {
    out: W,
    printed: Option<(usize, String)>,
    show_user: bool,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            printed: None,
            show_user: false,
        }
    }

    /// Echo user messages too (off for interactive use, where the prompt
    /// already shows them).
    pub fn echo_user(mut self, on: bool) -> Self {
        self.show_user = on;
        self
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::MessageAppended { index, message } => match message.role {
                Role::User => {
                    if self.show_user {
                        writeln!(self.out, "You: {}", message.content)?;
                    }
                }
                Role::Assistant => {
                    write!(self.out, "Assistant: {}", message.content)?;
                    if message.content.is_empty() {
                        self.printed = Some((*index, String::new()));
                    } else {
                        writeln!(self.out)?;
                        self.printed = None;
                    }
                }
            },
            SessionEvent::MessageUpdated { index, content } => {
                let previous = match self.printed.take() {
                    Some((printed_index, text)) if printed_index == *index => text,
                    _ => String::new(),
                };
                match content.strip_prefix(previous.as_str()) {
                    Some(suffix) => write!(self.out, "{suffix}")?,
                    None => write!(self.out, "\n{content}")?,
                }
                self.printed = Some((*index, content.clone()));
            }
            SessionEvent::StatusChanged(BusyIndicator::Shown(label)) => {
                writeln!(self.out, "… {label}")?;
            }
            SessionEvent::StatusChanged(BusyIndicator::Hidden) => {}
            SessionEvent::CitationsReplaced(set) => {
                if self.printed.take().is_some() {
                    writeln!(self.out)?;
                }
                match set.empty_notice() {
                    Some(notice) => writeln!(self.out, "({notice})")?,
                    None => {
                        writeln!(self.out, "Sources:")?;
                        for (index, citation) in set.citations().iter().enumerate() {
                            writeln!(self.out, "  {}. {}", index + 1, citation.title)?;
                            if citation.is_navigable() {
                                writeln!(self.out, "     {}", citation.url)?;
                            }
                        }
                    }
                }
            }
        }
        self.out.flush()
    }

    /// Ends the current line after a turn.
    pub fn finish_turn(&mut self) -> io::Result<()> {
        if self.printed.take().is_some() {
            writeln!(self.out)?;
        }
        self.out.flush()
    }
}
