/// Output composition: text pieces, glue, line breaks and tags, plus the
/// stack of nested capture contexts used while evaluating strings and tags.
///
/// Rules applied as pieces arrive:
/// - a newline before any visible text, after another newline, after glue
///   or directly after a function start is dropped;
/// - glue removes the newlines and whitespace-only text before it;
/// - a function end trims trailing newlines and whitespace of its output.
///
/// When a line is rendered, runs of spaces and tabs collapse to one space and
/// the line is trimmed.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Piece {
    Text(String),
    Newline,
    Glue,
    Tag(String),
    FunctionStart,
}

impl Piece {
    fn is_blank_text(&self) -> bool {
        matches!(self, Piece::Text(t) if t.trim().is_empty())
    }

    fn is_visible_text(&self) -> bool {
        matches!(self, Piece::Text(t) if !t.trim().is_empty())
    }
}

/// Where the buffer stands relative to a finished line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    /// Nothing visible yet.
    Empty,
    /// Text without a line break.
    Partial,
    /// A line break follows visible text, nothing visible after it.
    Complete,
    /// Visible text has started after the first line break.
    Overflow,
}

/// A finished line with the tags that belong to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    pub text: String,
    pub tags: Vec<String>,
}

impl Line {
    pub fn is_blank(&self) -> bool {
        self.text.is_empty() && self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputBuffer {
    pieces: Vec<Piece>,
}

impl OutputBuffer {
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    fn has_visible_text(&self) -> bool {
        self.pieces.iter().any(Piece::is_visible_text)
    }

    pub fn text(&mut self, text: &str) {
        if !text.is_empty() {
            self.pieces.push(Piece::Text(text.to_string()));
        }
    }

    pub fn newline(&mut self) {
        if !self.has_visible_text() {
            return;
        }
        let last = self
            .pieces
            .iter()
            .rev()
            .find(|p| !p.is_blank_text() && !matches!(p, Piece::Tag(_)));
        match last {
            Some(Piece::Newline | Piece::Glue | Piece::FunctionStart) | None => {}
            Some(_) => self.pieces.push(Piece::Newline),
        }
    }

    fn trim_trailing_breaks(&mut self) {
        while self
            .pieces
            .last()
            .is_some_and(|p| *p == Piece::Newline || p.is_blank_text())
        {
            self.pieces.pop();
        }
    }

    pub fn glue(&mut self) {
        self.trim_trailing_breaks();
        self.pieces.push(Piece::Glue);
    }

    pub fn tag(&mut self, tag: &str) {
        self.pieces.push(Piece::Tag(tag.trim().to_string()));
    }

    pub fn function_start(&mut self) {
        self.pieces.push(Piece::FunctionStart);
    }

    pub fn function_end(&mut self) {
        self.trim_trailing_breaks();
        if let Some(at) = self.pieces.iter().rposition(|p| *p == Piece::FunctionStart) {
            self.pieces.remove(at);
        }
    }

    pub fn line_state(&self) -> LineState {
        let Some(first_break) = self.pieces.iter().position(|p| *p == Piece::Newline) else {
            let has_content = self
                .pieces
                .iter()
                .any(|p| p.is_visible_text() || matches!(p, Piece::Tag(_)));
            return if has_content {
                LineState::Partial
            } else {
                LineState::Empty
            };
        };
        if self.pieces[first_break + 1..]
            .iter()
            .any(Piece::is_visible_text)
        {
            LineState::Overflow
        } else {
            LineState::Complete
        }
    }

    /// Remove and render everything up to the first line break.
    pub fn take_line(&mut self) -> Line {
        let cut = self
            .pieces
            .iter()
            .position(|p| *p == Piece::Newline)
            .map(|i| i + 1)
            .unwrap_or(self.pieces.len());
        let taken: Vec<Piece> = self.pieces.drain(..cut).collect();
        if self.pieces.iter().all(|p| p.is_blank_text() || *p == Piece::Newline) {
            self.pieces.clear();
        }
        let (text, tags) = render(&taken);
        Line { text, tags }
    }

    /// Render the whole buffer, keeping inner line breaks.
    pub fn render(&self) -> (String, Vec<String>) {
        render(&self.pieces)
    }
}

fn render(pieces: &[Piece]) -> (String, Vec<String>) {
    let mut raw = String::new();
    let mut tags = Vec::new();
    for piece in pieces {
        match piece {
            Piece::Text(t) => raw.push_str(t),
            Piece::Newline => raw.push('\n'),
            Piece::Tag(t) => tags.push(t.clone()),
            Piece::Glue | Piece::FunctionStart => {}
        }
    }
    let lines: Vec<String> = raw
        .split('\n')
        .map(clean_line)
        .collect();
    (lines.join("\n").trim_matches('\n').to_string(), tags)
}

fn clean_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_space = false;
    for c in line.chars() {
        if c == ' ' || c == '\t' {
            in_space = true;
        } else {
            if in_space && !out.is_empty() {
                out.push(' ');
            }
            in_space = false;
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureKind {
    String,
    Tag,
}

/// Text and tags produced inside a capture context.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub text: String,
    pub tags: Vec<String>,
}

/// The main output buffer and the stack of capture contexts above it. Only
/// the innermost context receives output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    main: OutputBuffer,
    captures: Vec<(CaptureKind, OutputBuffer)>,
}

impl Output {
    fn active(&mut self) -> &mut OutputBuffer {
        match self.captures.last_mut() {
            Some((_, buffer)) => buffer,
            None => &mut self.main,
        }
    }

    pub fn main(&self) -> &OutputBuffer {
        &self.main
    }

    pub fn is_capturing(&self) -> bool {
        !self.captures.is_empty()
    }

    pub fn text(&mut self, text: &str) {
        self.active().text(text);
    }

    pub fn newline(&mut self) {
        self.active().newline();
    }

    pub fn glue(&mut self) {
        self.active().glue();
    }

    pub fn tag(&mut self, tag: &str) {
        self.active().tag(tag);
    }

    pub fn function_start(&mut self) {
        self.active().function_start();
    }

    pub fn function_end(&mut self) {
        self.active().function_end();
    }

    pub fn begin_capture(&mut self, kind: CaptureKind) {
        self.captures.push((kind, OutputBuffer::default()));
    }

    /// Close the innermost capture. `None` if it is not of `kind`.
    pub fn end_capture(&mut self, kind: CaptureKind) -> Option<Captured> {
        if self.captures.last().map(|(k, _)| *k) != Some(kind) {
            return None;
        }
        let (_, buffer) = self.captures.pop()?;
        let (text, tags) = buffer.render();
        Some(Captured { text, tags })
    }

    pub fn line_state(&self) -> LineState {
        self.main.line_state()
    }

    pub fn take_line(&mut self) -> Line {
        self.main.take_line()
    }

    pub fn clear(&mut self) {
        self.main = OutputBuffer::default();
        self.captures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_and_repeated_newlines_are_dropped() {
        let mut out = OutputBuffer::default();
        out.newline();
        out.text("Hello");
        out.newline();
        out.newline();
        assert_eq!(out.line_state(), LineState::Complete);
        assert_eq!(out.take_line().text, "Hello");
        assert!(out.is_empty());
    }

    #[test]
    fn glue_joins_lines() {
        let mut out = OutputBuffer::default();
        out.text("Call1 ");
        out.newline();
        out.text("  ");
        out.glue();
        out.text("glued");
        assert_eq!(out.line_state(), LineState::Partial);
        out.newline();
        assert_eq!(out.take_line().text, "Call1 glued");
    }

    #[test]
    fn newline_after_glue_is_ignored() {
        let mut out = OutputBuffer::default();
        out.text("a");
        out.glue();
        out.newline();
        out.text("b");
        assert_eq!(out.line_state(), LineState::Partial);
        assert_eq!(out.take_line().text, "ab");
    }

    #[test]
    fn function_output_is_trimmed() {
        let mut out = OutputBuffer::default();
        out.text("The answer is ");
        out.function_start();
        out.newline();
        out.text("42");
        out.newline();
        out.function_end();
        out.text(".");
        assert_eq!(out.take_line().text, "The answer is 42.");
    }

    #[test]
    fn whitespace_collapses_and_overflow_is_detected() {
        let mut out = OutputBuffer::default();
        out.text("  two   spaces\t here ");
        out.newline();
        out.tag("next");
        assert_eq!(out.line_state(), LineState::Complete);
        out.text("more");
        assert_eq!(out.line_state(), LineState::Overflow);
        let line = out.take_line();
        assert_eq!(line.text, "two spaces here");
        assert!(line.tags.is_empty());
        let rest = out.take_line();
        assert_eq!(rest.text, "more");
        assert_eq!(rest.tags, vec!["next".to_string()]);
    }

    #[test]
    fn captures_nest_and_collect_tags() {
        let mut out = Output::default();
        out.text("main");
        out.begin_capture(CaptureKind::String);
        out.text("  Open ");
        out.tag("door");
        out.text("the  door ");
        assert!(out.end_capture(CaptureKind::Tag).is_none());
        let captured = out.end_capture(CaptureKind::String).unwrap();
        assert_eq!(captured.text, "Open the door");
        assert_eq!(captured.tags, vec!["door".to_string()]);
        assert!(!out.is_capturing());
        assert_eq!(out.take_line().text, "main");
    }
}
