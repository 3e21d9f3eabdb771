//! Text helpers for Telegram replies: markdown to HTML, message splitting,
//! truncation, and retrying Telegram calls.

// lazy_regex! keeps its statics in once_cell
#![allow(clippy::non_std_lazy_statics)]

use anyhow::Result;
use lazy_regex::{lazy_regex, Lazy};
use regex::{Captures, Regex};
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;

/// Fenced code block, optional language tag
static RE_FENCE: Lazy<Regex> = lazy_regex!(r"```([\w+#.-]*)[ \t]*\n?([\s\S]*?)```");

/// Inline code span
static RE_INLINE_CODE: Lazy<Regex> = lazy_regex!(r"`([^`\n]+)`");

/// Markdown heading line
static RE_HEADING: Lazy<Regex> = lazy_regex!(r"(?m)^#{1,6}[ \t]+(.+?)[ \t]*#*$");

/// Bullet at the start of a line
static RE_BULLET: Lazy<Regex> = lazy_regex!(r"(?m)^([ \t]*)[*-][ \t]+");

/// **bold**
static RE_BOLD: Lazy<Regex> = lazy_regex!(r"\*\*([^*\n]+?)\*\*");

/// *italic*, not touching surrounding whitespace
static RE_ITALIC: Lazy<Regex> = lazy_regex!(r"\*([^*\s](?:[^*\n]*?[^*\s])?)\*");

/// Runs of three or more newlines
static RE_MULTI_NEWLINE: Lazy<Regex> = lazy_regex!(r"\n{3,}");

const CODE_FENCE: &str = "```";

/// Formats a model reply (markdown) as Telegram HTML.
///
/// Code blocks become `<pre>`, inline code `<code>`, `**bold**` and `*italic*`
/// become `<b>` and `<i>`, headings are bolded, bullets become `•`. Everything
/// else is HTML-escaped, so naked `<`, `>` and `&` are safe.
///
/// # Examples
///
/// ```
/// use ai_models_bot::utils::format_text;
/// let formatted = format_text("**Bold** and *italic* with `a < b`");
/// assert_eq!(formatted, "<b>Bold</b> and <i>italic</i> with <code>a &lt; b</code>");
/// ```
#[must_use]
pub fn format_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut last = 0;

    for caps in RE_FENCE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&format_prose(&text[last..whole.start()], last == 0));

        let lang = caps.get(1).map_or("", |m| m.as_str());
        let code = caps.get(2).map_or("", |m| m.as_str()).trim_end();
        let code = html_escape::encode_text(code);
        if lang.is_empty() {
            out.push_str(&format!("<pre>{code}</pre>"));
        } else {
            out.push_str(&format!(
                "<pre><code class=\"language-{lang}\">{code}</code></pre>"
            ));
        }
        last = whole.end();
    }
    out.push_str(&format_prose(&text[last..], last == 0));

    RE_MULTI_NEWLINE
        .replace_all(&out, "\n\n")
        .trim()
        .to_string()
}

/// Formats text outside code blocks, keeping inline code spans verbatim
fn format_prose(text: &str, at_line_start: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in RE_INLINE_CODE.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&format_inline(&text[last..whole.start()], at_line_start && last == 0));
        let code = caps.get(1).map_or("", |m| m.as_str());
        out.push_str(&format!("<code>{}</code>", html_escape::encode_text(code)));
        last = whole.end();
    }
    out.push_str(&format_inline(&text[last..], at_line_start && last == 0));
    out
}

/// Line-level markup (headings, bullets) only applies to lines that start
/// inside `text`; the first line counts only when `at_line_start` is set.
fn format_inline(text: &str, at_line_start: bool) -> String {
    let escaped = html_escape::encode_text(text);
    let split_at = if at_line_start {
        0
    } else {
        escaped.find('\n').unwrap_or(escaped.len())
    };
    let (head, lines) = escaped.split_at(split_at);

    let headed = RE_HEADING.replace_all(lines, "<b>$1</b>");
    let bulleted = RE_BULLET.replace_all(&headed, |caps: &Captures| {
        format!("{}• ", caps.get(1).map_or("", |m| m.as_str()))
    });
    let joined = format!("{head}{bulleted}");

    let bold = RE_BOLD.replace_all(&joined, "<b>$1</b>");
    RE_ITALIC.replace_all(&bold, "<i>$1</i>").into_owned()
}

/// Splits a long message into parts no longer than `max_len` bytes.
///
/// Splits on line boundaries where possible. A code fence that is open at a
/// split point is closed at the end of the part and reopened (with its
/// language tag) at the start of the next one. Lines that do not fit on
/// their own are cut on grapheme boundaries.
///
/// # Examples
///
/// ```
/// use ai_models_bot::utils::split_long_message;
/// let parts = split_long_message(&"A fairly long line\n".repeat(300), 1000);
/// assert!(parts.len() > 1);
/// assert!(parts.iter().all(|p| p.len() <= 1000));
/// ```
#[must_use]
pub fn split_long_message(message: &str, max_len: usize) -> Vec<String> {
    if message.trim().is_empty() {
        return Vec::new();
    }
    if message.len() <= max_len {
        return vec![message.to_string()];
    }

    let mut splitter = Splitter::new(max_len);
    for line in message.lines() {
        splitter.push_line(line);
    }
    splitter.finish()
}

struct Splitter {
    max_len: usize,
    parts: Vec<String>,
    current: String,
    /// Opening line of the fence we are inside, if any
    open_fence: Option<String>,
}

impl Splitter {
    fn new(max_len: usize) -> Self {
        Self {
            max_len,
            parts: Vec::new(),
            current: String::new(),
            open_fence: None,
        }
    }

    /// Room kept free at the end of every part for a closing fence
    const fn closing_len() -> usize {
        CODE_FENCE.len() + 1
    }

    /// Largest line that always fits into a freshly started part
    fn line_budget(&self) -> usize {
        let reopen = self.open_fence.as_ref().map_or(0, |f| f.len() + 1);
        self.max_len
            .saturating_sub(reopen + Self::closing_len() + 1)
            .max(1)
    }

    fn push_line(&mut self, line: &str) {
        let toggles_fence = line.trim_start().starts_with(CODE_FENCE);

        if line.len() > self.line_budget() {
            for piece in grapheme_chunks(line, self.line_budget()) {
                self.push_fitting(&piece);
            }
        } else {
            self.push_fitting(line);
        }

        if toggles_fence {
            self.open_fence = match self.open_fence {
                Some(_) => None,
                None => Some(line.trim().to_string()),
            };
        }
    }

    fn push_fitting(&mut self, line: &str) {
        let needed = self.current.len() + line.len() + 1 + Self::closing_len();
        if needed > self.max_len && !self.current.is_empty() {
            self.cut();
        }
        self.current.push_str(line);
        self.current.push('\n');
    }

    fn cut(&mut self) {
        let mut part = std::mem::take(&mut self.current);
        // Whitespace-only runs are dropped rather than sent
        if !part.trim().is_empty() {
            if self.open_fence.is_some() {
                part.push_str(CODE_FENCE);
            }
            self.parts.push(part.trim_end().to_string());
        }

        if let Some(fence) = &self.open_fence {
            self.current.push_str(fence);
            self.current.push('\n');
        }
    }

    fn finish(mut self) -> Vec<String> {
        if !self.current.trim().is_empty() {
            let mut part = std::mem::take(&mut self.current);
            if self.open_fence.is_some() {
                part.push_str(CODE_FENCE);
            }
            self.parts.push(part.trim_end().to_string());
        }
        self.parts
    }
}

fn grapheme_chunks(line: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut chunk = String::new();
    for grapheme in line.graphemes(true) {
        if !chunk.is_empty() && chunk.len() + grapheme.len() > max_len {
            chunks.push(std::mem::take(&mut chunk));
        }
        chunk.push_str(grapheme);
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }
    chunks
}

/// Cuts a string to at most `max_chars` characters (not bytes).
///
/// # Examples
///
/// ```
/// use ai_models_bot::utils::truncate_str;
/// assert_eq!(truncate_str("Привет, мир!", 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    s.char_indices()
        .nth(max_chars)
        .map_or(s, |(end, _)| &s[..end])
        .to_string()
}

/// Retry a Telegram API call with exponential backoff and jitter.
///
/// Delays start at `TELEGRAM_API_INITIAL_BACKOFF_MS` and are capped at
/// `TELEGRAM_API_MAX_BACKOFF_MS`; at most `TELEGRAM_API_MAX_RETRIES` retries
/// follow the first attempt. Errors Telegram will repeat for the same request
/// (see [`is_permanent_telegram_error`]) are returned at once.
///
/// # Errors
///
/// Returns the first permanent error, or the last error once every attempt
/// has failed.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        get_telegram_api_initial_backoff_ms, get_telegram_api_max_backoff_ms,
        get_telegram_api_max_retries,
    };

    let strategy = ExponentialBackoff::from_millis(get_telegram_api_initial_backoff_ms())
        .max_delay(Duration::from_millis(get_telegram_api_max_backoff_ms()))
        .map(jitter)
        .take(get_telegram_api_max_retries());

    let mut operation = operation;
    let mut attempt = 0usize;
    let result = RetryIf::spawn(
        strategy,
        || {
            attempt += 1;
            if attempt > 1 {
                debug!(attempt = attempt, "Retrying Telegram API call");
            }
            operation()
        },
        |e: &anyhow::Error| !is_permanent_telegram_error(e),
    )
    .await;

    if let Err(e) = &result {
        warn!(attempts = attempt, error = %e, "Telegram API call failed");
    }
    result
}

/// Whether Telegram rejected the request itself (bad markup, unchanged or
/// missing message, blocked bot), so sending it again cannot succeed.
#[must_use]
pub fn is_permanent_telegram_error(error: &anyhow::Error) -> bool {
    const PERMANENT: &[&str] = &["Bad Request", "Forbidden", "can't parse entities"];

    let message = error.to_string();
    PERMANENT.iter().any(|marker| message.contains(marker))
}
